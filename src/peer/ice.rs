use crate::peer::connection::PeerConnection;
use crate::peer::types::IceCandidate;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Кандидат, полученный до установки remote description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCandidate {
    pub candidate: IceCandidate,
    pub received_at: DateTime<Utc>,
}

/// Очередь отложенных удалённых кандидатов.
///
/// Порядок поступления сохраняется; при переполнении выбрасывается самый
/// старый кандидат.
#[derive(Debug)]
pub struct CandidateBuffer {
    queue: VecDeque<PendingCandidate>,
    capacity: usize,
    dropped: usize,
}

impl CandidateBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: VecDeque::with_capacity(capacity.min(16)),
            capacity,
            dropped: 0,
        }
    }

    /// Возвращает вытесненный кандидат, если буфер был полон
    pub fn push(&mut self, candidate: IceCandidate) -> Option<PendingCandidate> {
        let evicted = if self.queue.len() >= self.capacity {
            self.dropped += 1;
            self.queue.pop_front()
        } else {
            None
        };
        self.queue.push_back(PendingCandidate {
            candidate,
            received_at: Utc::now(),
        });
        evicted
    }

    pub fn flush(&mut self) -> Vec<IceCandidate> {
        self.queue.drain(..).map(|p| p.candidate).collect()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Сколько кандидатов потеряно из-за переполнения
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

/// Применяет все отложенные кандидаты после установки remote description
pub async fn apply_pending_candidates(
    call_id: &str,
    pc: &dyn PeerConnection,
    buffer: &mut CandidateBuffer,
) -> usize {
    let candidates = buffer.flush();
    let total = candidates.len();
    if total > 0 {
        tracing::debug!(target: "peercall::ice", call_id, total, "applying pending candidates");
    }
    for candidate in candidates {
        if let Err(e) = pc.add_ice_candidate(candidate).await {
            tracing::warn!(target: "peercall::ice", call_id, "failed to apply pending candidate: {e}");
        }
    }
    total
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateStats {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateStats {
    let mut stats = CandidateStats::default();
    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            stats.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            stats.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            stats.relay += 1;
        }
    }

    tracing::debug!(
        target: "peercall::ice",
        "Candidate analysis: {} host, {} srflx, {} relay",
        stats.host,
        stats.srflx,
        stats.relay
    );
    if !candidates.is_empty() && stats.relay == 0 {
        tracing::debug!(
            target: "peercall::ice",
            "no TURN relay candidates gathered, connection through symmetric NAT may fail"
        );
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(n: usize) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000 typ host"))
    }

    #[test]
    fn flush_preserves_push_order_and_empties() {
        let mut buffer = CandidateBuffer::new(100);
        for n in 0..10 {
            assert!(buffer.push(cand(n)).is_none());
        }
        let flushed = buffer.flush();
        assert_eq!(flushed, (0..10).map(cand).collect::<Vec<_>>());
        assert!(buffer.is_empty());
        assert!(buffer.flush().is_empty());
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut buffer = CandidateBuffer::new(3);
        for n in 0..3 {
            buffer.push(cand(n));
        }
        let evicted = buffer.push(cand(3)).expect("oldest evicted");
        assert_eq!(evicted.candidate, cand(0));
        buffer.push(cand(4));
        assert_eq!(buffer.dropped(), 2);
        assert_eq!(buffer.flush(), vec![cand(2), cand(3), cand(4)]);
    }

    #[test]
    fn analysis_counts_candidate_types() {
        let list = vec![
            IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 1 typ host"),
            IceCandidate::new("candidate:2 1 udp 1 1.2.3.4 1 typ srflx raddr 10.0.0.1 rport 1"),
            IceCandidate::new("candidate:3 1 udp 1 5.6.7.8 1 typ relay raddr 1.2.3.4 rport 1"),
            IceCandidate::new("candidate:4 1 udp 1 10.0.0.2 1 typ host"),
        ];
        assert_eq!(
            analyze_candidates(&list),
            CandidateStats {
                host: 2,
                srflx: 1,
                relay: 1
            }
        );
    }
}
