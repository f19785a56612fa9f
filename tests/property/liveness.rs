// tests/property/liveness.rs

use std::time::{Duration, Instant};

use proptest::prelude::*;

use taskgov::registry::{Liveness, LivenessPolicy, WorkerInfo, WorkerRegistry};
use taskgov::types::{LoadSnapshot, Resources, WorkerId};

const INTERVAL_MS: u64 = 100;

/// State after one liveness check, given the state before it.
fn after_check(before: Liveness, silent_ms: u64, n: u32) -> Liveness {
    let missed = silent_ms.saturating_sub(INTERVAL_MS) / INTERVAL_MS;
    match before {
        Liveness::Suspected if missed >= u64::from(n) => Liveness::Disconnected,
        Liveness::Connected if missed >= u64::from(n.saturating_sub(1).max(1)) => {
            Liveness::Suspected
        }
        other => other,
    }
}

proptest! {
    #[test]
    fn liveness_follows_missed_heartbeat_windows(
        n in 1u32..5,
        steps in proptest::collection::vec((0u64..350, any::<bool>()), 1..30),
    ) {
        let policy = LivenessPolicy {
            heartbeat_interval: Duration::from_millis(INTERVAL_MS),
            disconnect_after_missed_heartbeats: n,
        };
        let mut registry = WorkerRegistry::new(policy);
        let start = Instant::now();
        let worker = WorkerId(1);
        let info = WorkerInfo {
            address: "10.0.0.1:7000".into(),
            data_address: "10.0.0.1:7001".into(),
            capacity: Resources::cpus(1),
        };
        prop_assert!(registry.register(worker, info, start).is_ok());

        let mut now = start;
        let mut last_heard = start;
        let mut model = Liveness::Connected;
        for (gap, heartbeat) in steps {
            now += Duration::from_millis(gap);
            if heartbeat {
                prop_assert!(registry.heartbeat(worker, LoadSnapshot::default(), now).is_ok());
                last_heard = now;
                model = Liveness::Connected;
            }
            let report = registry.check_liveness(now);
            let silent = now.duration_since(last_heard).as_millis() as u64;
            model = after_check(model, silent, n);
            let state = registry.get(worker).map(|w| w.liveness);
            prop_assert_eq!(state, Some(model));

            if state == Some(Liveness::Disconnected) {
                prop_assert_eq!(report.disconnected, vec![worker]);
                prop_assert!(registry.on_disconnect(worker).is_some());
                prop_assert!(!registry.contains(worker));
                break;
            }
            prop_assert_eq!(
                registry.get(worker).map(|w| w.is_schedulable()),
                Some(state == Some(Liveness::Connected))
            );
        }
    }
}
