// Copyright 2022 Singularity Data
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Operator-facing state kinds, thin facades over the state table. All of
//! them address state under the current key context; the namespace tells the
//! kinds of one operator apart.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::backend::StateBackend;
use crate::table::StateTable;

/// Single value per key.
pub struct ValueState<'a, S: StateBackend> {
    table: &'a mut StateTable<S>,
    namespace: Bytes,
}

impl<'a, S: StateBackend> ValueState<'a, S> {
    pub fn new(table: &'a mut StateTable<S>, namespace: impl Into<Bytes>) -> Self {
        Self {
            table,
            namespace: namespace.into(),
        }
    }

    pub fn get(&self) -> Option<Bytes> {
        self.table.get(&self.namespace)
    }

    pub fn put(&mut self, value: Bytes) {
        self.table.put(&self.namespace, value)
    }

    pub fn clear(&mut self) {
        self.table.remove(&self.namespace);
    }
}

/// Append-only list per key, stored as length-prefixed elements in one value.
pub struct ListState<'a, S: StateBackend> {
    table: &'a mut StateTable<S>,
    namespace: Bytes,
}

impl<'a, S: StateBackend> ListState<'a, S> {
    pub fn new(table: &'a mut StateTable<S>, namespace: impl Into<Bytes>) -> Self {
        Self {
            table,
            namespace: namespace.into(),
        }
    }

    pub fn append(&mut self, element: &[u8]) {
        let mut buf = match self.table.get(&self.namespace) {
            Some(existing) => BytesMut::from(&existing[..]),
            None => BytesMut::new(),
        };
        buf.put_u32_le(element.len() as u32);
        buf.put_slice(element);
        self.table.put(&self.namespace, buf.freeze());
    }

    pub fn get_all(&self) -> Vec<Bytes> {
        let Some(raw) = self.table.get(&self.namespace) else {
            return vec![];
        };
        let mut buf = raw;
        let mut elements = vec![];
        while buf.has_remaining() {
            let len = buf.get_u32_le() as usize;
            elements.push(buf.copy_to_bytes(len));
        }
        elements
    }

    pub fn clear(&mut self) {
        self.table.remove(&self.namespace);
    }
}

/// Accumulator per key, merged with a caller-supplied reduce function.
/// Aggregating and folding kinds are expressed through this one by choosing
/// the merge function.
pub struct ReducingState<'a, S: StateBackend, F>
where
    F: Fn(&[u8], &[u8]) -> Bytes,
{
    value: ValueState<'a, S>,
    reduce: F,
}

impl<'a, S: StateBackend, F> ReducingState<'a, S, F>
where
    F: Fn(&[u8], &[u8]) -> Bytes,
{
    pub fn new(table: &'a mut StateTable<S>, namespace: impl Into<Bytes>, reduce: F) -> Self {
        Self {
            value: ValueState::new(table, namespace),
            reduce,
        }
    }

    pub fn add(&mut self, element: &[u8]) {
        let next = match self.value.get() {
            Some(acc) => (self.reduce)(&acc, element),
            None => Bytes::copy_from_slice(element),
        };
        self.value.put(next);
    }

    pub fn get(&self) -> Option<Bytes> {
        self.value.get()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_value_state() {
        let mut table = StateTable::new_heap(8);
        table.set_current_key(b"user-1");

        let mut state = ValueState::new(&mut table, "count");
        assert_eq!(state.get(), None);
        state.put(Bytes::from("1"));
        assert_eq!(state.get(), Some(Bytes::from("1")));
        state.clear();
        assert_eq!(state.get(), None);
    }

    #[test]
    fn test_value_state_is_per_key() {
        let mut table = StateTable::new_heap(8);
        table.set_current_key(b"user-1");
        ValueState::new(&mut table, "count").put(Bytes::from("1"));

        table.set_current_key(b"user-2");
        assert_eq!(ValueState::new(&mut table, "count").get(), None);
    }

    #[test]
    fn test_list_state() {
        let mut table = StateTable::new_heap(8);
        table.set_current_key(b"user-1");

        let mut state = ListState::new(&mut table, "events");
        state.append(b"a");
        state.append(b"bc");
        assert_eq!(
            state.get_all(),
            vec![Bytes::from("a"), Bytes::from("bc")]
        );
    }

    #[test]
    fn test_reducing_state_sums() {
        let mut table = StateTable::new_heap(8);
        table.set_current_key(b"user-1");

        let sum = |acc: &[u8], elem: &[u8]| {
            let a = u64::from_le_bytes(acc.try_into().unwrap());
            let b = u64::from_le_bytes(elem.try_into().unwrap());
            Bytes::copy_from_slice(&(a + b).to_le_bytes())
        };
        let mut state = ReducingState::new(&mut table, "sum", sum);
        state.add(&3u64.to_le_bytes());
        state.add(&4u64.to_le_bytes());
        let total = u64::from_le_bytes(state.get().unwrap()[..].try_into().unwrap());
        assert_eq!(total, 7);
    }
}
