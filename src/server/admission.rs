//! Per-source-IP admission control for the side-channel server. See
//! SPEC_FULL.md §4.5 and Testable Property 3.

use std::{collections::HashMap, net::IpAddr, time::Instant};

/// Wire codes sent in step 3 of the side-channel sequence on denial.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum DenialCode {
    /// `replayName` could not be loaded from the trace store.
    UnknownReplay = 1,
    /// Another admission holds this source IP and is not stale.
    Busy = 2,
    /// Host resource thresholds were exceeded.
    Overloaded = 3,
}

/// Outcome of an admission request.
#[derive(Clone, Debug)]
pub enum Verdict {
    /// Admitted; carries the bucket count to advertise to the client.
    Admitted { bucket_count: u32 },
    /// Denied with the given wire code.
    Denied(DenialCode),
}

/// One held admission claim, keyed by observed data-plane IP.
#[derive(Clone, Debug)]
pub struct AdmissionSlot {
    /// Client's persistent real ID.
    pub real_id: String,
    /// Replay this slot was admitted for.
    pub replay_name: String,
    /// Test ID within the client's session.
    pub test_id: u32,
    /// Last time this slot observed activity.
    pub last_active: Instant,
}

impl AdmissionSlot {
    fn is_stale(&self, idle_timeout: std::time::Duration) -> bool {
        self.last_active.elapsed() >= idle_timeout
    }
}

/// Single-writer admission table: only the side-channel accept loop
/// mutates this, per SPEC_FULL.md §5's "mutated only from the SC task"
/// rule, so no internal locking is needed.
#[derive(Default)]
pub struct AdmissionTable {
    /// Slot currently held per observed data-plane IP.
    by_ip: HashMap<IpAddr, AdmissionSlot>,
    /// The IP currently holding a slot for a given real ID, so a
    /// reconnecting client under the same real ID from a different IP can
    /// be detected and the stale slot reclaimed.
    in_progress: HashMap<String, IpAddr>,
}

impl AdmissionTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies the admission rules of SPEC_FULL.md §4.5 step 3 for a
    /// client observed at `ip` with the given `real_id`/`replay_name`/
    /// `test_id`, given whether the replay name is loadable and the host
    /// is currently overloaded.
    pub fn try_admit(
        &mut self,
        ip: IpAddr,
        real_id: &str,
        replay_name: &str,
        test_id: u32,
        replay_loadable: bool,
        overloaded: bool,
        idle_timeout: std::time::Duration,
        bucket_count: u32,
    ) -> Verdict {
        if let Some(other_ip) = self.in_progress.get(real_id).copied() {
            if other_ip != ip {
                self.release_ip(other_ip);
            }
        }

        if let Some(existing) = self.by_ip.get(&ip) {
            if existing.real_id != real_id {
                if existing.is_stale(idle_timeout) {
                    self.release_ip(ip);
                } else {
                    return Verdict::Denied(DenialCode::Busy);
                }
            }
        }

        if overloaded {
            return Verdict::Denied(DenialCode::Overloaded);
        }

        if !replay_loadable {
            return Verdict::Denied(DenialCode::UnknownReplay);
        }

        self.in_progress.insert(real_id.to_owned(), ip);
        self.by_ip.insert(
            ip,
            AdmissionSlot {
                real_id: real_id.to_owned(),
                replay_name: replay_name.to_owned(),
                test_id,
                last_active: Instant::now(),
            },
        );
        Verdict::Admitted { bucket_count }
    }

    /// Releases the slot held at `ip`, if any, and its reverse
    /// `in_progress` entry. Called at end-of-test (client's `endOfTest`
    /// flag, or `test_id == 1`) or on a kill triggered by a conflicting
    /// real ID.
    pub fn release_ip(&mut self, ip: IpAddr) {
        if let Some(slot) = self.by_ip.remove(&ip) {
            self.in_progress.remove(&slot.real_id);
        }
    }

    /// Whether the client should keep its slot after this test, per the
    /// end-of-test rule in SPEC_FULL.md §4.5.
    #[must_use]
    pub fn should_release(end_of_test: bool, test_id: u32) -> bool {
        end_of_test || test_id == 1
    }

    /// Touches the slot at `ip`, if any, resetting its idle clock.
    pub fn touch(&mut self, ip: IpAddr) {
        if let Some(slot) = self.by_ip.get_mut(&ip) {
            slot.last_active = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ip(n: u8) -> IpAddr {
        std::net::Ipv4Addr::new(198, 51, 100, n).into()
    }

    #[test]
    fn second_client_same_ip_different_real_id_is_denied() {
        let mut table = AdmissionTable::new();
        let first = table.try_admit(
            ip(1), "real-a", "youtube-360p", 0, true, false,
            Duration::from_secs(300), 100,
        );
        assert!(matches!(first, Verdict::Admitted { .. }));

        let second = table.try_admit(
            ip(1), "real-b", "youtube-360p", 0, true, false,
            Duration::from_secs(300), 100,
        );
        assert!(matches!(second, Verdict::Denied(DenialCode::Busy)));
    }

    #[test]
    fn stale_slot_is_reclaimed() {
        let mut table = AdmissionTable::new();
        table.by_ip.insert(
            ip(1),
            AdmissionSlot {
                real_id: "real-a".into(),
                replay_name: "youtube-360p".into(),
                test_id: 0,
                last_active: Instant::now() - Duration::from_secs(301),
            },
        );
        let verdict = table.try_admit(
            ip(1), "real-b", "youtube-360p", 0, true, false,
            Duration::from_secs(300), 100,
        );
        assert!(matches!(verdict, Verdict::Admitted { .. }));
    }

    #[test]
    fn overload_denies_even_when_replay_is_loadable() {
        let mut table = AdmissionTable::new();
        let verdict = table.try_admit(
            ip(1), "real-a", "youtube-360p", 0, true, true,
            Duration::from_secs(300), 100,
        );
        assert!(matches!(verdict, Verdict::Denied(DenialCode::Overloaded)));
    }

    #[test]
    fn unknown_replay_denies() {
        let mut table = AdmissionTable::new();
        let verdict = table.try_admit(
            ip(1), "real-a", "no-such-replay", 0, false, false,
            Duration::from_secs(300), 100,
        );
        assert!(matches!(verdict, Verdict::Denied(DenialCode::UnknownReplay)));
    }
}
