//! Replay side of the record/replay engine.
//!
//! A run walks the message list on its own task, sleeping up to each
//! message's offset and emitting the decoded payload. Pausing aborts the
//! task and banks the elapsed offset; resuming starts a fresh task that
//! skips everything already emitted.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::warn;

use super::RecordedMessage;

/// Settle time after the final message before the run reports completion.
const TAIL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerFrame {
    Binary(Vec<u8>),
    Text(String),
}

struct Run {
    started_at: Instant,
    handle: JoinHandle<()>,
}

pub struct Player {
    messages: Arc<Vec<RecordedMessage>>,
    /// Elapsed playback time banked across pauses.
    offset_ms: u64,
    run: Option<Run>,
}

impl Player {
    pub fn new(messages: Vec<RecordedMessage>) -> Self {
        Self {
            messages: Arc::new(messages),
            offset_ms: 0,
            run: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    /// Start (or resume) emitting frames into `out`. `done` fires once the
    /// last message plus the tail delay has elapsed.
    pub fn start(
        &mut self,
        out: mpsc::UnboundedSender<PlayerFrame>,
        done: impl FnOnce() + Send + 'static,
    ) {
        let messages = Arc::clone(&self.messages);
        let offset = self.offset_ms;
        let started_at = Instant::now();
        let handle = tokio::spawn(async move {
            for message in messages.iter().filter(|m| m.at >= offset) {
                let due = started_at + Duration::from_millis(message.at - offset);
                sleep_until(due).await;
                let frame = if message.binary {
                    match BASE64.decode(&message.data) {
                        Ok(bytes) => PlayerFrame::Binary(bytes),
                        Err(e) => {
                            warn!(error = %e, "skipping undecodable recorded frame");
                            continue;
                        }
                    }
                } else {
                    PlayerFrame::Text(message.data.clone())
                };
                // The receiver side drops frames once the upstream socket is
                // gone; a failed send here is the same no-op.
                if out.send(frame).is_err() {
                    break;
                }
            }
            sleep_until(started_at + remaining(&messages, offset) + TAIL).await;
            done();
        });
        self.run = Some(Run { started_at, handle });
    }

    /// Cancel all pending timers and bank the elapsed offset.
    pub fn pause(&mut self) {
        if let Some(run) = self.run.take() {
            run.handle.abort();
            self.offset_ms += run.started_at.elapsed().as_millis() as u64;
        }
    }

    pub fn stop(&mut self) {
        if let Some(run) = self.run.take() {
            run.handle.abort();
        }
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.stop();
    }
}

fn remaining(messages: &[RecordedMessage], offset: u64) -> Duration {
    let last = messages.last().map(|m| m.at).unwrap_or(0);
    Duration::from_millis(last.saturating_sub(offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::time::{advance, pause as pause_time};

    fn messages() -> Vec<RecordedMessage> {
        vec![
            RecordedMessage {
                at: 0,
                data: BASE64.encode([1u8]),
                binary: true,
            },
            RecordedMessage {
                at: 250,
                data: "two".into(),
                binary: false,
            },
            RecordedMessage {
                at: 600,
                data: BASE64.encode([3u8]),
                binary: true,
            },
        ]
    }

    #[test_deadline::tokio_timeout_test]
    async fn replays_with_original_gaps_then_reports_done() {
        pause_time();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let done = Arc::new(AtomicBool::new(false));
        let done_flag = Arc::clone(&done);

        let mut player = Player::new(messages());
        player.start(tx, move || done_flag.store(true, Ordering::SeqCst));

        advance(Duration::from_millis(1)).await;
        assert_eq!(rx.try_recv().unwrap(), PlayerFrame::Binary(vec![1]));
        assert!(rx.try_recv().is_err());

        advance(Duration::from_millis(250)).await;
        assert_eq!(rx.try_recv().unwrap(), PlayerFrame::Text("two".into()));

        advance(Duration::from_millis(350)).await;
        assert_eq!(rx.try_recv().unwrap(), PlayerFrame::Binary(vec![3]));
        assert!(!done.load(Ordering::SeqCst));

        advance(Duration::from_millis(250)).await;
        assert!(done.load(Ordering::SeqCst));
    }

    #[test_deadline::tokio_timeout_test]
    async fn pause_banks_elapsed_and_resume_skips_played_messages() {
        pause_time();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut player = Player::new(messages());
        player.start(tx, || {});

        advance(Duration::from_millis(100)).await;
        assert_eq!(rx.try_recv().unwrap(), PlayerFrame::Binary(vec![1]));
        player.pause();
        assert!(!player.is_running());

        // Long paused gap leaves the timeline untouched.
        advance(Duration::from_millis(5_000)).await;
        assert!(rx.try_recv().is_err());

        let (tx2, mut rx2) = mpsc::unbounded_channel();
        player.start(tx2, || {});
        advance(Duration::from_millis(150)).await;
        assert_eq!(rx2.try_recv().unwrap(), PlayerFrame::Text("two".into()));
        advance(Duration::from_millis(350)).await;
        assert_eq!(rx2.try_recv().unwrap(), PlayerFrame::Binary(vec![3]));
    }

    #[test_deadline::tokio_timeout_test]
    async fn dropped_receiver_is_a_no_op() {
        pause_time();
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let done = Arc::new(AtomicBool::new(false));
        let done_flag = Arc::clone(&done);
        let mut player = Player::new(messages());
        player.start(tx, move || done_flag.store(true, Ordering::SeqCst));
        advance(Duration::from_millis(900)).await;
        assert!(done.load(Ordering::SeqCst));
    }
}
