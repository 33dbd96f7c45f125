//! NIC/infiniband volatile hwaddr/name allocation.

use std::collections::BTreeSet;

use rand::Rng;

/// A locally-administered, unicast MAC in the `00:16:3e:xx:xx:xx` range
/// LXD-style drivers use for generated NIC addresses.
pub fn generate_mac() -> String {
    let mut rng = rand::rng();
    format!(
        "00:16:3e:{:02x}:{:02x}:{:02x}",
        rng.random::<u8>(),
        rng.random::<u8>(),
        rng.random::<u8>()
    )
}

/// Pick the lowest free `<prefix><N>` name not in `claimed`.
pub fn lowest_free_name(prefix: &str, claimed: &BTreeSet<String>) -> String {
    for n in 0.. {
        let candidate = format!("{prefix}{n}");
        if !claimed.contains(&candidate) {
            return candidate;
        }
    }
    unreachable!("u32 name space exhausted")
}

/// The volatile interface-name prefix for a device kind.
pub fn name_prefix(kind: &str) -> &'static str {
    match kind {
        "infiniband" => "ib",
        _ => "eth",
    }
}
