use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use portmux_observe::EventType;

const MAX_TRACKED_FLOW_STATES: usize = 16_384;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlowLifecycleState {
    Accepted,
    Classified,
    TlsStarted,
    TlsReady,
    HandshakeComplete,
    TunnelEstablished,
    StreamClosing,
    Closed,
}

#[derive(Debug)]
struct FlowTrackerEntry {
    state: FlowLifecycleState,
    next_flow_sequence_id: u64,
}

impl Default for FlowTrackerEntry {
    fn default() -> Self {
        Self {
            state: FlowLifecycleState::Accepted,
            next_flow_sequence_id: 1,
        }
    }
}

#[derive(Debug, Default)]
struct FlowStateStore {
    entries: HashMap<u64, FlowTrackerEntry>,
    order: VecDeque<u64>,
}

#[derive(Debug, Default)]
pub(crate) struct FlowStateTracker {
    store: Mutex<FlowStateStore>,
}

impl FlowStateTracker {
    pub(crate) fn on_event(&self, flow_id: u64, kind: EventType) -> u64 {
        let mut store = self.store.lock().expect("flow state lock poisoned");
        if let std::collections::hash_map::Entry::Vacant(entry) = store.entries.entry(flow_id) {
            entry.insert(FlowTrackerEntry::default());
            store.order.push_back(flow_id);
        }

        let mut close_transition = false;
        let flow_sequence_id = {
            let entry = store
                .entries
                .get_mut(&flow_id)
                .expect("flow entry must exist");
            let flow_sequence_id = entry.next_flow_sequence_id;
            entry.next_flow_sequence_id = entry.next_flow_sequence_id.saturating_add(1);

            let current_state = entry.state;
            if let Some(next_state) = next_flow_state(current_state, kind) {
                entry.state = next_state;
                close_transition = next_state == FlowLifecycleState::Closed;
            } else {
                debug_assert!(
                    false,
                    "illegal flow transition for flow_id={flow_id}: state={current_state:?}, event={kind:?}"
                );
            }
            flow_sequence_id
        };

        if close_transition {
            store.entries.remove(&flow_id);
        }

        while store.entries.len() > MAX_TRACKED_FLOW_STATES {
            let Some(evicted_flow_id) = store.order.pop_front() else {
                break;
            };
            store.entries.remove(&evicted_flow_id);
        }

        flow_sequence_id
    }
}

pub(crate) fn next_flow_state(
    current: FlowLifecycleState,
    kind: EventType,
) -> Option<FlowLifecycleState> {
    match kind {
        EventType::ConnectionAccepted => {
            (current == FlowLifecycleState::Accepted).then_some(FlowLifecycleState::Accepted)
        }
        // TLS classification triggers a second detection pass over the
        // decrypted bytes, so Classified and TlsReady both re-classify.
        EventType::ProtocolDetected => matches!(
            current,
            FlowLifecycleState::Accepted | FlowLifecycleState::TlsReady
        )
        .then_some(FlowLifecycleState::Classified),
        EventType::TlsHandshakeStarted => matches!(
            current,
            FlowLifecycleState::Classified | FlowLifecycleState::TlsStarted
        )
        .then_some(FlowLifecycleState::TlsStarted),
        EventType::TlsHandshakeSucceeded => {
            (current == FlowLifecycleState::TlsStarted).then_some(FlowLifecycleState::TlsReady)
        }
        EventType::TlsHandshakeFailed => matches!(
            current,
            FlowLifecycleState::Classified | FlowLifecycleState::TlsStarted
        )
        .then_some(FlowLifecycleState::StreamClosing),
        EventType::SocksHandshakeCompleted => (current == FlowLifecycleState::Classified)
            .then_some(FlowLifecycleState::HandshakeComplete),
        EventType::SocksHandshakeFailed => (current == FlowLifecycleState::Classified)
            .then_some(FlowLifecycleState::StreamClosing),
        EventType::TunnelEstablished => matches!(
            current,
            FlowLifecycleState::Classified | FlowLifecycleState::HandshakeComplete
        )
        .then_some(FlowLifecycleState::TunnelEstablished),
        EventType::TunnelConnectFailed => matches!(
            current,
            FlowLifecycleState::Classified | FlowLifecycleState::HandshakeComplete
        )
        .then_some(FlowLifecycleState::StreamClosing),
        EventType::RelayBufferFlushed | EventType::RelayBufferOverflow => {
            (current == FlowLifecycleState::TunnelEstablished)
                .then_some(FlowLifecycleState::TunnelEstablished)
        }
        EventType::BinaryExchangeCompleted => {
            (current == FlowLifecycleState::Classified).then_some(FlowLifecycleState::StreamClosing)
        }
        EventType::UpgradeRequired => {
            (current == FlowLifecycleState::Classified).then_some(FlowLifecycleState::StreamClosing)
        }
        EventType::StreamClosed => {
            (current != FlowLifecycleState::Closed).then_some(FlowLifecycleState::Closed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{next_flow_state, FlowLifecycleState};
    use portmux_observe::EventType;

    #[test]
    fn flow_state_machine_allows_socks_tunnel_lifecycle() {
        let s1 = next_flow_state(FlowLifecycleState::Accepted, EventType::ProtocolDetected)
            .expect("protocol_detected");
        let s2 = next_flow_state(s1, EventType::SocksHandshakeCompleted).expect("handshake");
        let s3 = next_flow_state(s2, EventType::TunnelEstablished).expect("tunnel");
        let s4 = next_flow_state(s3, EventType::RelayBufferFlushed).expect("flush");
        let s5 = next_flow_state(s4, EventType::StreamClosed).expect("closed");
        assert_eq!(s5, FlowLifecycleState::Closed);
    }

    #[test]
    fn flow_state_machine_allows_tls_reclassification() {
        let s1 = next_flow_state(FlowLifecycleState::Accepted, EventType::ProtocolDetected)
            .expect("first pass");
        let s2 = next_flow_state(s1, EventType::TlsHandshakeStarted).expect("tls started");
        let s3 = next_flow_state(s2, EventType::TlsHandshakeSucceeded).expect("tls ready");
        let s4 = next_flow_state(s3, EventType::ProtocolDetected).expect("second pass");
        assert_eq!(s4, FlowLifecycleState::Classified);
    }

    #[test]
    fn flow_state_machine_rejects_handshake_before_classification() {
        let invalid = next_flow_state(
            FlowLifecycleState::Accepted,
            EventType::SocksHandshakeCompleted,
        );
        assert!(
            invalid.is_none(),
            "socks handshake must require protocol_detected"
        );
    }
}
