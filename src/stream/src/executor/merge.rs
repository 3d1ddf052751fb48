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

use async_trait::async_trait;
use futures::channel::mpsc::Receiver;
use futures::future::select_all;
use futures::StreamExt;

use super::{Barrier, Executor, Message};
use crate::error::{StreamError, StreamResult};

/// `ReceiverExecutor` pulls from a single channel. Used by tasks with exactly
/// one upstream.
pub struct ReceiverExecutor {
    receiver: Receiver<Message>,
}

impl ReceiverExecutor {
    pub fn new(receiver: Receiver<Message>) -> Self {
        Self { receiver }
    }
}

#[async_trait]
impl Executor for ReceiverExecutor {
    async fn next(&mut self) -> StreamResult<Message> {
        self.receiver.next().await.ok_or(StreamError::ChannelClosed)
    }

    fn identity(&self) -> &str {
        "ReceiverExecutor"
    }
}

/// `MergeExecutor` merges data from multiple upstream channels and aligns
/// barriers: a channel that yielded a barrier is parked until every channel
/// yielded the same barrier, which is then emitted once. Reconfig-points and
/// cancel markers align exactly like checkpoints.
pub struct MergeExecutor {
    /// Number of inputs after the last (re)connect.
    num_inputs: usize,

    /// Active channels.
    active: Vec<Receiver<Message>>,

    /// Channels blocked by the alignment in progress.
    blocked: Vec<Receiver<Message>>,

    /// The barrier being aligned.
    next_barrier: Option<Barrier>,
}

impl MergeExecutor {
    pub fn new(inputs: Vec<Receiver<Message>>) -> Self {
        Self {
            num_inputs: inputs.len(),
            active: inputs,
            blocked: vec![],
            next_barrier: None,
        }
    }

    pub fn num_inputs(&self) -> usize {
        self.num_inputs
    }

    /// Substitute the input gate. Only legal at a safe point: no alignment
    /// may be in progress, otherwise in-flight barriers would be lost.
    pub fn update_inputs(&mut self, inputs: Vec<Receiver<Message>>) -> StreamResult<()> {
        if !self.blocked.is_empty() || self.next_barrier.is_some() {
            return Err(StreamError::RewireFailure(
                "input gate substitution during barrier alignment".to_string(),
            ));
        }
        self.num_inputs = inputs.len();
        self.active = inputs;
        Ok(())
    }

    /// Attach one more upstream channel, e.g. after the upstream was rewired
    /// to this task.
    pub fn add_input(&mut self, input: Receiver<Message>) -> StreamResult<()> {
        if !self.blocked.is_empty() || self.next_barrier.is_some() {
            return Err(StreamError::RewireFailure(
                "input gate growth during barrier alignment".to_string(),
            ));
        }
        self.active.push(input);
        self.num_inputs += 1;
        Ok(())
    }
}

#[async_trait]
impl Executor for MergeExecutor {
    async fn next(&mut self) -> StreamResult<Message> {
        loop {
            // Convert channel receivers to futures here to do `select_all`.
            let mut futures = vec![];
            for ch in self.active.drain(..) {
                futures.push(ch.into_future());
            }
            let ((message, from), _id, remains) = select_all(futures).await;
            for fut in remains {
                self.active.push(fut.into_inner().unwrap());
            }

            let message = message.ok_or(StreamError::ChannelClosed)?;

            match message {
                Message::Record(record) => {
                    self.active.push(from);
                    return Ok(Message::Record(record));
                }
                Message::Barrier(barrier) => {
                    if self.blocked.is_empty() {
                        assert_eq!(self.next_barrier, None);
                        self.next_barrier = Some(barrier.clone());
                    } else {
                        assert_eq!(self.next_barrier, Some(barrier));
                    }
                    // Park this channel until the alignment completes.
                    self.blocked.push(from);
                }
            }

            if self.blocked.len() == self.num_inputs {
                // Emit the barrier downstream once collected from every input.
                assert!(self.active.is_empty());
                self.active = std::mem::take(&mut self.blocked);
                let barrier = self.next_barrier.take().unwrap();
                return Ok(Message::Barrier(barrier));
            }
            assert!(!self.active.is_empty());
        }
    }

    fn identity(&self) -> &str {
        "MergeExecutor"
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use futures::SinkExt;

    use super::*;
    use crate::executor::StreamRecord;

    fn record(key: &str, payload: &str) -> Message {
        Message::Record(StreamRecord::new(
            key.as_bytes().to_vec(),
            payload.as_bytes().to_vec(),
        ))
    }

    #[tokio::test]
    async fn test_merger_aligns_barriers() {
        const CHANNEL_NUMBER: usize = 10;
        let mut txs = Vec::with_capacity(CHANNEL_NUMBER);
        let mut rxs = Vec::with_capacity(CHANNEL_NUMBER);
        for _ in 0..CHANNEL_NUMBER {
            let (tx, rx) = futures::channel::mpsc::channel(16);
            txs.push(tx);
            rxs.push(rx);
        }
        let mut merger = MergeExecutor::new(rxs);

        let mut handles = Vec::with_capacity(CHANNEL_NUMBER);
        for mut tx in txs {
            let handle = tokio::spawn(async move {
                for epoch in 1..=3u64 {
                    tx.send(record("key", "payload")).await.unwrap();
                    tx.send(Message::Barrier(Barrier::new_test_barrier(epoch)))
                        .await
                        .unwrap();
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            });
            handles.push(handle);
        }

        for epoch in 1..=3u64 {
            // Expect one record per channel, then exactly one aligned barrier.
            for _ in 0..CHANNEL_NUMBER {
                assert_matches!(merger.next().await.unwrap(), Message::Record(_));
            }
            assert_matches!(merger.next().await.unwrap(), Message::Barrier(barrier) => {
                assert_eq!(barrier.epoch, epoch);
            });
        }

        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_add_input_grows_the_gate() {
        let (mut tx1, rx1) = futures::channel::mpsc::channel(16);
        let mut merger = MergeExecutor::new(vec![rx1]);

        let (mut tx2, rx2) = futures::channel::mpsc::channel(16);
        merger.add_input(rx2).unwrap();
        assert_eq!(merger.num_inputs(), 2);

        tx2.send(record("from-new-channel", "payload")).await.unwrap();
        assert_matches!(merger.next().await.unwrap(), Message::Record(record) => {
            assert_eq!(record.key, "from-new-channel".as_bytes());
        });

        // Alignment now requires the barrier on both channels.
        tx1.send(Message::Barrier(Barrier::new_test_barrier(1)))
            .await
            .unwrap();
        tx1.send(record("after-barrier", "payload")).await.unwrap();
        tx2.send(Message::Barrier(Barrier::new_test_barrier(1)))
            .await
            .unwrap();
        assert_matches!(merger.next().await.unwrap(), Message::Barrier(_));
    }

    #[tokio::test]
    async fn test_update_inputs_rejected_mid_alignment() {
        let (mut tx1, rx1) = futures::channel::mpsc::channel(16);
        let (mut tx2, rx2) = futures::channel::mpsc::channel(16);
        let mut merger = MergeExecutor::new(vec![rx1, rx2]);

        tx1.send(Message::Barrier(Barrier::new_test_barrier(1)))
            .await
            .unwrap();
        tx2.send(record("key", "payload")).await.unwrap();

        // The record passes through while channel 1 is parked.
        assert_matches!(merger.next().await.unwrap(), Message::Record(_));
        let (_tx3, rx3) = futures::channel::mpsc::channel::<Message>(16);
        assert_matches!(
            merger.update_inputs(vec![rx3]),
            Err(StreamError::RewireFailure(_))
        );

        // Completing the alignment makes substitution legal again.
        tx2.send(Message::Barrier(Barrier::new_test_barrier(1)))
            .await
            .unwrap();
        assert_matches!(merger.next().await.unwrap(), Message::Barrier(_));
        let (_tx4, rx4) = futures::channel::mpsc::channel::<Message>(16);
        merger.update_inputs(vec![rx4]).unwrap();
        assert_eq!(merger.num_inputs(), 1);
    }
}
