//! Version strings advertised in discovery: `MAJOR.MINOR.PATCH[-suffix]`.
//! A suffix marks a test build; on an equal base a stable build is newer.

use std::cmp::Ordering;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Stable,
    Test,
}

pub fn channel(version: &str) -> Channel {
    if version.contains('-') {
        Channel::Test
    } else {
        Channel::Stable
    }
}

fn base(version: &str) -> &str {
    version.split('-').next().unwrap_or(version)
}

/// Compare numeric dotted bases (missing or non-numeric parts count as 0), then channel.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let a_parts: Vec<&str> = base(a).split('.').collect();
    let b_parts: Vec<&str> = base(b).split('.').collect();
    let len = a_parts.len().max(b_parts.len());
    for i in 0..len {
        let an: u64 = a_parts.get(i).and_then(|p| p.parse().ok()).unwrap_or(0);
        let bn: u64 = b_parts.get(i).and_then(|p| p.parse().ok()).unwrap_or(0);
        match an.cmp(&bn) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    match (channel(a), channel(b)) {
        (Channel::Stable, Channel::Test) => Ordering::Greater,
        (Channel::Test, Channel::Stable) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

/// Whether `candidate` is newer than `current`.
pub fn is_newer(candidate: &str, current: &str) -> bool {
    compare_versions(candidate, current) == Ordering::Greater
}
