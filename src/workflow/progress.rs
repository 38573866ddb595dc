//! Per-session progress buffer with replay.
//!
//! The orchestrator is the only producer. Every subscriber, whenever it
//! attaches, first receives the whole buffer and then live events, ending
//! after the terminal event. Sequence numbers are assigned under the same
//! lock that appends, so the stream is gapless by construction.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use autoship_common::{
    ErrorKind, ProgressEvent, SessionId, SessionState, TerminalStatus, is_valid_transition,
};
use chrono::Utc;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::watch;

struct Buffer {
    events: Vec<ProgressEvent>,
    state: SessionState,
    percent: u8,
    closed: bool,
}

pub struct ProgressStream {
    session_id: SessionId,
    buffer: Mutex<Buffer>,
    /// Bumped on every append; subscribers wait on it.
    appended: watch::Sender<usize>,
}

impl std::fmt::Debug for ProgressStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressStream")
            .field("session_id", &self.session_id)
            .field("len", &self.len())
            .finish()
    }
}

impl ProgressStream {
    /// A new stream for a session that starts in `Created`. The caller
    /// emits the first event.
    pub fn new(session_id: SessionId) -> Arc<Self> {
        let (appended, _) = watch::channel(0);
        Arc::new(Self {
            session_id,
            buffer: Mutex::new(Buffer {
                events: Vec::new(),
                state: SessionState::Created,
                percent: 0,
                closed: false,
            }),
            appended,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Everything buffered so far.
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.lock().events.clone()
    }

    fn push(
        &self,
        state: SessionState,
        phase: &str,
        message: &str,
        terminal: Option<TerminalStatus>,
        error_kind: Option<ErrorKind>,
    ) -> Option<ProgressEvent> {
        let event = {
            let mut buf = self.lock();
            if buf.closed {
                tracing::error!(session_id = %self.session_id, phase, "event after terminal event dropped");
                return None;
            }
            let percent = state.percent().unwrap_or(buf.percent).max(buf.percent);
            let event = ProgressEvent {
                session_id: self.session_id,
                sequence: buf.events.len() as u64 + 1,
                state,
                phase: phase.to_string(),
                message: message.to_string(),
                percent,
                terminal,
                error_kind,
                timestamp: Utc::now(),
            };
            buf.events.push(event.clone());
            buf.state = state;
            buf.percent = percent;
            buf.closed = terminal.is_some();
            event
        };
        tracing::info!(
            session_id = %self.session_id,
            seq = event.sequence,
            state = %event.state,
            percent = event.percent,
            "{}",
            event.message
        );
        self.appended.send_replace(event.sequence as usize);
        Some(event)
    }

    /// The first event of every session.
    pub fn created(&self, message: &str) -> Option<ProgressEvent> {
        if !self.is_empty() {
            return None;
        }
        self.push(SessionState::Created, SessionState::Created.as_str(), message, None, None)
    }

    /// Move to `to`. Entering `Succeeded` closes the stream.
    pub fn transition(&self, to: SessionState, message: &str) -> Option<ProgressEvent> {
        let from = self.state();
        if to == SessionState::Failed || !is_valid_transition(from, to) {
            tracing::error!(session_id = %self.session_id, from = %from, to = %to, "invalid transition");
            return None;
        }
        let terminal = (to == SessionState::Succeeded).then_some(TerminalStatus::Success);
        self.push(to, to.as_str(), message, terminal, None)
    }

    /// An informational event that does not change state.
    pub fn note(&self, phase: &str, message: &str) -> Option<ProgressEvent> {
        let state = self.state();
        self.push(state, phase, message, None, None)
    }

    /// Terminal failure from whatever state the session is in.
    pub fn fail(&self, kind: ErrorKind, message: &str) -> Option<ProgressEvent> {
        let from = self.state();
        self.push(
            SessionState::Failed,
            &format!("{}:{}", SessionState::Failed.as_str(), from.as_str()),
            message,
            Some(TerminalStatus::Failure),
            Some(kind),
        )
    }

    /// Buffered events followed by live ones; ends after the terminal event.
    pub fn subscribe(self: &Arc<Self>) -> BoxStream<'static, ProgressEvent> {
        let rx = self.appended.subscribe();
        futures::stream::unfold((Arc::clone(self), rx, 0usize), |(stream, mut rx, cursor)| async move {
            loop {
                {
                    let buf = stream.lock();
                    if let Some(event) = buf.events.get(cursor) {
                        let event = event.clone();
                        drop(buf);
                        return Some((event, (stream, rx, cursor + 1)));
                    }
                    if buf.closed {
                        return None;
                    }
                }
                if rx.changed().await.is_err() {
                    // Producer gone without a terminal event; drain and stop.
                    let next = stream.lock().events.get(cursor).cloned();
                    return next.map(|event| (event, (stream, rx, cursor + 1)));
                }
            }
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn stream() -> Arc<ProgressStream> {
        let s = ProgressStream::new(SessionId::new());
        s.created("created");
        s
    }

    #[test]
    fn test_sequence_is_gapless_and_percent_monotonic() {
        let s = stream();
        s.transition(SessionState::Analyzing, "analyzing");
        s.note("provisioning", "note");
        s.transition(SessionState::Generating, "generating");
        s.fail(ErrorKind::Generation, "boom");

        let events = s.events();
        let seqs: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert!(events.windows(2).all(|w| w[0].percent <= w[1].percent));
        assert_eq!(events[2].state, SessionState::Analyzing);
        assert_eq!(events[4].percent, 30);
        assert_eq!(events[4].phase, "failed:generating");
        assert_eq!(events[4].error_kind, Some(ErrorKind::Generation));
    }

    #[test]
    fn test_nothing_after_terminal() {
        let s = stream();
        s.fail(ErrorKind::Cancelled, "cancelled");
        assert!(s.is_closed());
        assert!(s.note("x", "late").is_none());
        assert!(s.fail(ErrorKind::Io, "again").is_none());
        let events = s.events();
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert!(events.last().unwrap().is_terminal());
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let s = stream();
        assert!(s.transition(SessionState::Testing, "skip ahead").is_none());
        assert!(s.transition(SessionState::Failed, "use fail()").is_none());
        assert!(s.created("twice").is_none());
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn test_success_closes_stream() {
        let s = stream();
        for state in [
            SessionState::Analyzing,
            SessionState::Generating,
            SessionState::Applying,
            SessionState::Testing,
            SessionState::Deploying,
            SessionState::Succeeded,
        ] {
            assert!(s.transition(state, state.as_str()).is_some());
        }
        let last = s.events().pop().unwrap();
        assert_eq!(last.terminal, Some(TerminalStatus::Success));
        assert_eq!(last.percent, 100);
        assert!(s.is_closed());
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_replay_then_live() {
        let s = stream();
        s.transition(SessionState::Analyzing, "a");

        let mut early = s.subscribe();
        assert_eq!(early.next().await.unwrap().sequence, 1);

        let producer = Arc::clone(&s);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.transition(SessionState::Generating, "g");
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.fail(ErrorKind::Generation, "bad patch");
        });

        let late: Vec<u64> = s.subscribe().map(|e| e.sequence).collect().await;
        assert_eq!(late, vec![1, 2, 3, 4]);

        let rest: Vec<u64> = early.map(|e| e.sequence).collect().await;
        assert_eq!(rest, vec![2, 3, 4]);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_after_close_replays_and_ends() {
        let s = stream();
        s.fail(ErrorKind::Provision, "no sandbox");
        let all: Vec<ProgressEvent> = s.subscribe().collect().await;
        assert_eq!(all.len(), 2);
        assert!(all[1].is_terminal());
    }

    #[tokio::test]
    async fn test_many_concurrent_subscribers_see_same_sequence() {
        let s = stream();
        let subscribers: Vec<_> = (0..8)
            .map(|_| {
                let sub = s.subscribe();
                tokio::spawn(async move { sub.map(|e| e.sequence).collect::<Vec<_>>().await })
            })
            .collect();
        for _ in 0..50 {
            s.note("tick", "tick");
            tokio::task::yield_now().await;
        }
        s.fail(ErrorKind::Cancelled, "stop");
        let expected: Vec<u64> = (1..=52).collect();
        for sub in subscribers {
            assert_eq!(sub.await.unwrap(), expected);
        }
    }
}
