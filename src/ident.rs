use std::sync::atomic::{AtomicU64, Ordering};

// Largest integer every JSON consumer represents exactly.
const MAX_SAFE_COUNTER: u64 = 9_007_199_254_740_991;

/// 4-hex-char per-process token. Distinguishes peers sharing one host.
pub(crate) fn random_token() -> String {
    format!("{:04x}", rand::random::<u16>())
}

pub(crate) fn host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_owned())
}

/// Deterministic broker client id, at most 23 bytes:
/// `"vrpcp" + instance + "X" + first 13 hex chars of MD5(host fingerprint)`.
///
/// The fingerprint is stable per machine, so two peers on the same host
/// differ only in the 16-bit `instance` token.
pub(crate) fn client_id(instance: &str) -> String {
    let digest = format!("{:x}", md5::compute(host_fingerprint()));
    format!("vrpcp{instance}X{}", &digest[..13])
}

/// Concatenates arch, cpu count, home dir, hostname, network interfaces,
/// platform, kernel release, total memory and OS type, in that order.
fn host_fingerprint() -> String {
    let sys = sysinfo::System::new_all();
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_default();
    let networks = sysinfo::Networks::new_with_refreshed_list();
    let mut interfaces: Vec<String> = Vec::new();
    for (name, data) in &networks {
        interfaces.push(format!("{name}{}", data.mac_address()));
    }
    interfaces.sort();
    format!(
        "{}{}{}{}{}{}{}{}{}",
        std::env::consts::ARCH,
        sys.cpus().len(),
        home,
        host_name(),
        interfaces.concat(),
        std::env::consts::OS,
        sysinfo::System::kernel_version().unwrap_or_default(),
        sys.total_memory(),
        sysinfo::System::name().unwrap_or_default(),
    )
}

/// Produces correlation ids `"{instance}-{counter}"` with a monotonic
/// counter wrapping at the safe integer bound.
pub(crate) struct CallIds {
    instance: String,
    counter: AtomicU64,
}

impl CallIds {
    pub(crate) fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            counter: AtomicU64::new(0),
        }
    }

    pub(crate) fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) % MAX_SAFE_COUNTER;
        format!("{}-{}", self.instance, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_fits_mqtt_limit() {
        let id = client_id(&random_token());
        assert!(id.len() <= 23, "{id} is {} bytes", id.len());
        assert!(id.starts_with("vrpcp"));
    }

    #[test]
    fn client_id_is_deterministic_per_instance() {
        assert_eq!(client_id("abcd"), client_id("abcd"));
        assert_ne!(client_id("abcd"), client_id("dcba"));
    }

    #[test]
    fn call_ids_are_unique_and_prefixed() {
        let ids = CallIds::new("ab12");
        let a = ids.next();
        let b = ids.next();
        assert_ne!(a, b);
        assert!(a.starts_with("ab12-"));
    }
}
