use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    OutgoingInvite,
    IncomingInvite,
    /// От accept до первого `Connected`
    NegotiationDeadline,
    ReconnectGrace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerEvent {
    pub call_id: String,
    pub kind: TimerKind,
}

pub type TimerSender = mpsc::UnboundedSender<TimerEvent>;

/// Отложенная задача; снимается при drop.
///
/// Сработавший таймер всё равно проверяется по `call_id` получателем:
/// событие может уже лежать в очереди к моменту отмены.
#[derive(Debug)]
pub struct TimerGuard {
    handle: JoinHandle<()>,
}

impl TimerGuard {
    pub fn arm(tx: &TimerSender, call_id: &str, kind: TimerKind, after: Duration) -> Self {
        let tx = tx.clone();
        let event = TimerEvent {
            call_id: call_id.to_string(),
            kind,
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(event);
        });
        Self { handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
