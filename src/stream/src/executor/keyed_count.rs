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

use bytes::Bytes;
use spacker_storage::keyed::ValueState;
use spacker_storage::{StateBackend, StateTable};

use super::StreamRecord;
use crate::error::StreamResult;

/// A keyed operator is invoked once per record, under the key context the
/// input processor sets beforehand. All of its state lives in the task's
/// state table, which is what makes it migratable.
pub trait KeyedOperator<S: StateBackend>: Send + 'static {
    fn process(
        &mut self,
        record: &StreamRecord,
        state: &mut StateTable<S>,
    ) -> StreamResult<Option<StreamRecord>>;

    fn identity(&self) -> &str;
}

/// Counts records per key and emits the running count. Small enough to
/// reason about in tests, stateful enough to exercise every migration path.
pub struct KeyedCountOperator;

const COUNT_NS: &[u8] = b"count";

impl<S: StateBackend> KeyedOperator<S> for KeyedCountOperator {
    fn process(
        &mut self,
        record: &StreamRecord,
        state: &mut StateTable<S>,
    ) -> StreamResult<Option<StreamRecord>> {
        let mut value = ValueState::new(state, COUNT_NS);
        let count = match value.get() {
            Some(raw) => u64::from_le_bytes(raw[..].try_into().expect("corrupt count state")) + 1,
            None => 1,
        };
        value.put(Bytes::copy_from_slice(&count.to_le_bytes()));
        Ok(Some(StreamRecord::new(
            record.key.clone(),
            count.to_le_bytes().to_vec(),
        )))
    }

    fn identity(&self) -> &str {
        "KeyedCountOperator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_of(record: &StreamRecord) -> u64 {
        u64::from_le_bytes(record.payload[..].try_into().unwrap())
    }

    #[test]
    fn test_counts_per_key() {
        let mut table = StateTable::new_heap(8);
        let mut operator = KeyedCountOperator;

        for (key, expected) in [("a", 1), ("a", 2), ("b", 1), ("a", 3)] {
            let record = StreamRecord::new(key.as_bytes().to_vec(), "");
            table.set_current_key(&record.key);
            let out = operator.process(&record, &mut table).unwrap().unwrap();
            assert_eq!(count_of(&out), expected);
            assert_eq!(out.key, record.key);
        }
    }
}
