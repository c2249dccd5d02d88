use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// One message addressed to exactly one recipient.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub peer: String,
    pub sender: String,
    pub recipient: String,
    pub data: Arc<[u8]>,
}

impl WorkUnit {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("work queue is closed")]
pub struct QueueClosed;

/// Producer side of the work queue. Cloned freely by listener threads.
#[derive(Debug, Clone)]
pub struct Intake {
    sender: mpsc::Sender<WorkUnit>,
}

/// Consumer side, shared by every worker.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    receiver: Arc<Mutex<mpsc::Receiver<WorkUnit>>>,
}

#[derive(Debug)]
pub enum Dequeued {
    Unit(WorkUnit),
    /// The wait bound elapsed with nothing to do.
    Idle,
    /// Every intake handle is gone and the queue is drained.
    Closed,
}

/// Creates a FIFO holding at most `capacity` units.
pub fn work_queue(capacity: usize) -> (Intake, WorkQueue) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (
        Intake { sender },
        WorkQueue {
            receiver: Arc::new(Mutex::new(receiver)),
        },
    )
}

impl Intake {
    /// Fans a submission out into one unit per recipient, in recipient
    /// order. Waits for queue space when the queue is full.
    pub async fn submit(
        &self,
        peer: &str,
        sender: &str,
        recipients: &[String],
        data: Vec<u8>,
    ) -> Result<usize, QueueClosed> {
        let data: Arc<[u8]> = Arc::from(data);
        for recipient in recipients {
            let unit = WorkUnit {
                peer: peer.to_string(),
                sender: sender.to_string(),
                recipient: recipient.clone(),
                data: Arc::clone(&data),
            };
            self.sender.send(unit).await.map_err(|_| QueueClosed)?;
        }
        log::debug!(
            "Queued {} byte message from {} for {} recipient(s)",
            data.len(),
            sender,
            recipients.len()
        );
        Ok(recipients.len())
    }

    /// Same as [`Intake::submit`] for listeners running on plain threads.
    /// Must not be called from inside the async runtime.
    pub fn blocking_submit(
        &self,
        peer: &str,
        sender: &str,
        recipients: &[String],
        data: Vec<u8>,
    ) -> Result<usize, QueueClosed> {
        let data: Arc<[u8]> = Arc::from(data);
        for recipient in recipients {
            let unit = WorkUnit {
                peer: peer.to_string(),
                sender: sender.to_string(),
                recipient: recipient.clone(),
                data: Arc::clone(&data),
            };
            self.sender.blocking_send(unit).map_err(|_| QueueClosed)?;
        }
        Ok(recipients.len())
    }

    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }

    /// Units enqueued and not yet taken by a worker.
    pub fn pending(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }
}

impl WorkQueue {
    /// Takes the next unit, giving up after `wait`.
    pub async fn next(&self, wait: Duration) -> Dequeued {
        let receive = async {
            let mut receiver = self.receiver.lock().await;
            receiver.recv().await
        };
        match tokio::time::timeout(wait, receive).await {
            Ok(Some(unit)) => Dequeued::Unit(unit),
            Ok(None) => Dequeued::Closed,
            Err(_) => Dequeued::Idle,
        }
    }
}
