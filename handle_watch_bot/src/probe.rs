use std::{future::Future, time::Duration};

use rand::seq::IndexedRandom;

use crate::{Handle, ProbeStatus, ProfileDetails};

/// What came back from one look at a profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub status: ProbeStatus,
    pub details: Option<ProfileDetails>,
}

impl ProbeReport {
    #[must_use]
    pub fn status_only(status: ProbeStatus) -> Self {
        Self {
            status,
            details: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("timed out")]
    Timeout,
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Something that can tell whether a profile is up or banned.
///
/// May be slow, may fail. A failure is just another observation to the monitor.
pub trait StatusProbe: Send + Sync {
    fn check(
        &self,
        handle: &Handle,
    ) -> impl Future<Output = Result<ProbeReport, ProbeError>> + Send;
}

/// Stand-in for a real profile source: waits a bit and makes something up, mostly
/// "active" with the occasional "banned".
#[derive(Debug, Clone)]
pub struct SimulatedProbe {
    delay: Duration,
}

impl SimulatedProbe {
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for SimulatedProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl StatusProbe for SimulatedProbe {
    async fn check(&self, handle: &Handle) -> Result<ProbeReport, ProbeError> {
        tokio::time::sleep(self.delay).await;
        Ok(make_up_report(handle))
    }
}

fn make_up_report(handle: &Handle) -> ProbeReport {
    static STATUSES: &[ProbeStatus] = &[
        ProbeStatus::Active,
        ProbeStatus::Banned,
        ProbeStatus::Active,
        ProbeStatus::Active,
    ];

    let mut rng = rand::rng();
    let status = STATUSES
        .choose(&mut rng)
        .copied()
        .unwrap_or(ProbeStatus::Active);

    let mut name = handle.as_str().to_string();
    if let Some(first) = name.get_mut(0..1) {
        first.make_ascii_uppercase();
    }

    let details = ProfileDetails {
        name: Some(format!("{name} Profile")),
        followers: rand::random_range(100..50_000),
        following: rand::random_range(50..2_000),
        posts: rand::random_range(1..500),
        private: rand::random_bool(0.5),
        verified: rand::random_bool(0.5),
        business: rand::random_bool(0.5),
    };

    ProbeReport {
        status,
        details: Some(details),
    }
}
