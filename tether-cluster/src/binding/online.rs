use dashmap::DashSet;
use tracing::debug;

/// Cluster-wide set of online numeric user ids, fed by binding watch events
#[derive(Debug, Default)]
pub struct OnlineUsers {
    users: DashSet<u64>,
}

impl OnlineUsers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-numeric uids are not tracked
    pub fn add(&self, uid: &str) {
        match uid.parse::<u64>() {
            Ok(id) => {
                self.users.insert(id);
            }
            Err(_) => debug!(uid = %uid, "Ignoring non-numeric uid in binding event"),
        }
    }

    pub fn remove(&self, uid: &str) {
        if let Ok(id) = uid.parse::<u64>() {
            self.users.remove(&id);
        }
    }

    #[must_use]
    pub fn contains(&self, uid: u64) -> bool {
        self.users.contains(&uid)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
