//! Pre-start isolation verification.
//!
//! The verifier inspects one instance declaration against the filesystem,
//! the port registry and the declared bind address, and produces a
//! complete report: every check runs even after an earlier one fails.
//! Any error-severity violation gates the spawn.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::instance::ServiceInstance;
use crate::process::control;
use crate::registry::PortRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationLayer {
    Directory,
    PortRegistry,
    IpBinding,
    ProcessBinding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub layer: ViolationLayer,
    pub severity: Severity,
    pub detail: String,
}

impl Violation {
    fn error(layer: ViolationLayer, detail: impl Into<String>) -> Self {
        Self {
            layer,
            severity: Severity::Error,
            detail: detail.into(),
        }
    }

    fn warning(layer: ViolationLayer, detail: impl Into<String>) -> Self {
        Self {
            layer,
            severity: Severity::Warning,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub passed: bool,
    pub violations: Vec<Violation>,
}

impl VerifyReport {
    fn from_violations(violations: Vec<Violation>) -> Self {
        let passed = !violations.iter().any(|v| v.severity == Severity::Error);
        Self { passed, violations }
    }
}

/// Gate between a declared instance and its OS process.
pub struct IsolationVerifier {
    allowed_base: PathBuf,
    registry: Arc<dyn PortRegistry>,
}

impl IsolationVerifier {
    pub fn new(allowed_base: PathBuf, registry: Arc<dyn PortRegistry>) -> Self {
        Self {
            allowed_base,
            registry,
        }
    }

    /// Run every pre-start check and produce the full report.
    pub async fn verify(&self, instance: &ServiceInstance) -> VerifyReport {
        let mut violations = self.check_directory(instance);
        violations.extend(self.check_ports(instance).await);
        violations.extend(check_ip(instance));
        VerifyReport::from_violations(violations)
    }

    /// Directory layer: the binary must resolve, symlink-free, to a path
    /// under the allowed base, with a parent no looser than 0750 and the
    /// executable bit set.
    fn check_directory(&self, instance: &ServiceInstance) -> Vec<Violation> {
        let mut violations = Vec::new();
        let path = &instance.binary_path;

        let base = match self.allowed_base.canonicalize() {
            Ok(base) => base,
            Err(e) => {
                violations.push(Violation::error(
                    ViolationLayer::Directory,
                    format!(
                        "allowed base {} is unavailable: {}",
                        self.allowed_base.display(),
                        e
                    ),
                ));
                return violations;
            }
        };

        let canonical = match path.canonicalize() {
            Ok(canonical) => canonical,
            Err(e) => {
                violations.push(Violation::error(
                    ViolationLayer::Directory,
                    format!("binary {} cannot be resolved: {}", path.display(), e),
                ));
                return violations;
            }
        };

        if !canonical.starts_with(&base) {
            violations.push(Violation::error(
                ViolationLayer::Directory,
                format!(
                    "binary {} escapes the allowed directory {}",
                    canonical.display(),
                    base.display()
                ),
            ));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;

            if let Some(parent) = canonical.parent() {
                match std::fs::metadata(parent) {
                    Ok(meta) => {
                        // Anything beyond 0750: group write, or any world bit.
                        let mode = meta.permissions().mode() & 0o777;
                        if mode & 0o027 != 0 {
                            violations.push(Violation::error(
                                ViolationLayer::Directory,
                                format!(
                                    "parent directory {} permissions {:o} exceed 0750",
                                    parent.display(),
                                    mode
                                ),
                            ));
                        }
                    }
                    Err(e) => violations.push(Violation::error(
                        ViolationLayer::Directory,
                        format!("cannot stat parent of {}: {}", canonical.display(), e),
                    )),
                }
            }

            match std::fs::metadata(&canonical) {
                Ok(meta) => {
                    if !meta.is_file() {
                        violations.push(Violation::error(
                            ViolationLayer::Directory,
                            format!("{} is not a regular file", canonical.display()),
                        ));
                    } else if meta.permissions().mode() & 0o111 == 0 {
                        violations.push(Violation::error(
                            ViolationLayer::Directory,
                            format!("{} is not executable", canonical.display()),
                        ));
                    }
                }
                Err(e) => violations.push(Violation::error(
                    ViolationLayer::Directory,
                    format!("cannot stat {}: {}", canonical.display(), e),
                )),
            }
        }

        violations
    }

    /// Port Registry layer: every declared port must be allocated to this
    /// instance, nothing else.
    async fn check_ports(&self, instance: &ServiceInstance) -> Vec<Violation> {
        let mut violations = Vec::new();
        for spec in &instance.ports {
            match self.registry.lookup(spec.port, spec.protocol).await {
                Ok(Some(owner)) if owner == instance.id => {}
                Ok(Some(owner)) => violations.push(Violation::error(
                    ViolationLayer::PortRegistry,
                    format!(
                        "port {}/{:?} is allocated to {}",
                        spec.port, spec.protocol, owner
                    ),
                )),
                Ok(None) => violations.push(Violation::error(
                    ViolationLayer::PortRegistry,
                    format!("port {}/{:?} is not allocated", spec.port, spec.protocol),
                )),
                Err(e) => violations.push(Violation::error(
                    ViolationLayer::PortRegistry,
                    format!(
                        "registry lookup for {}/{:?} failed: {}",
                        spec.port, spec.protocol, e
                    ),
                )),
            }
        }
        violations
    }

    /// Process Binding layer (post-start): the live PID must listen on
    /// exactly the declared TCP ports at the declared address. A declared
    /// port that has not appeared yet is only a warning; slow starters
    /// surface through health checks instead.
    pub fn verify_bindings(&self, instance: &ServiceInstance, pid: u32) -> VerifyReport {
        let declared = instance.tcp_ports();

        let Some(actual) = control::listening_tcp(pid) else {
            log::warn!(
                "No per-process binding table on this platform, skipping check for {}",
                instance.id
            );
            return VerifyReport::from_violations(vec![Violation::warning(
                ViolationLayer::ProcessBinding,
                "binding table unavailable on this platform",
            )]);
        };

        let mut violations = Vec::new();

        for port in &declared {
            match actual.iter().find(|(_, p)| p == port) {
                None => violations.push(Violation::warning(
                    ViolationLayer::ProcessBinding,
                    format!("declared port {} is not bound yet", port),
                )),
                Some((ip, _)) => {
                    if ip.is_unspecified() {
                        violations.push(Violation::error(
                            ViolationLayer::ProcessBinding,
                            format!(
                                "port {} is bound to a wildcard address instead of {}",
                                port, instance.listen_ip
                            ),
                        ));
                    } else if !ip_matches(instance.listen_ip, *ip) {
                        violations.push(Violation::error(
                            ViolationLayer::ProcessBinding,
                            format!(
                                "port {} is bound to {} instead of {}",
                                port, ip, instance.listen_ip
                            ),
                        ));
                    }
                }
            }
        }

        for (ip, port) in &actual {
            if !declared.contains(port) {
                violations.push(Violation::error(
                    ViolationLayer::ProcessBinding,
                    format!("undeclared listener on {}:{}", ip, port),
                ));
            }
        }

        VerifyReport::from_violations(violations)
    }
}

/// IP Binding layer: the declared address must be a specific unicast
/// address.
fn check_ip(instance: &ServiceInstance) -> Vec<Violation> {
    let ip = instance.listen_ip;
    if ip.is_unspecified() {
        return vec![Violation::error(
            ViolationLayer::IpBinding,
            format!("listen address {} is a wildcard", ip),
        )];
    }
    if ip.is_multicast() {
        return vec![Violation::error(
            ViolationLayer::IpBinding,
            format!("listen address {} is not unicast", ip),
        )];
    }
    Vec::new()
}

/// Address comparison tolerant of v4-mapped v6 listeners.
fn ip_matches(declared: IpAddr, actual: IpAddr) -> bool {
    if declared == actual {
        return true;
    }
    match (declared, actual) {
        (IpAddr::V4(v4), IpAddr::V6(v6)) | (IpAddr::V6(v6), IpAddr::V4(v4)) => {
            v6.to_ipv4_mapped() == Some(v4)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use std::time::Duration;

    use super::{IsolationVerifier, Severity, ViolationLayer};
    use crate::instance::{FeatureKind, HealthSpec, PortSpec, ServiceInstance};
    use crate::registry::MemoryPortRegistry;

    fn instance(binary: &std::path::Path, ports: Vec<PortSpec>) -> ServiceInstance {
        ServiceInstance {
            id: "svc-1".to_string(),
            kind: FeatureKind::Proxy,
            name: "proxy".to_string(),
            binary_path: binary.to_path_buf(),
            working_dir: binary.parent().unwrap().to_path_buf(),
            env: Vec::new(),
            args: Vec::new(),
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ports,
            caps: None,
            shutdown_grace: Duration::from_secs(2),
            auto_restart: false,
            health: HealthSpec::default(),
            router_id: "router-1".to_string(),
        }
    }

    #[cfg(unix)]
    fn make_executable(path: &std::path::Path) {
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o750)).unwrap();
    }

    #[cfg(unix)]
    fn setup_base() -> (tempfile::TempDir, std::path::PathBuf) {
        use std::os::unix::fs::PermissionsExt as _;
        let dir = tempfile::tempdir().unwrap();
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o750)).unwrap();
        let bin = dir.path().join("svcd");
        std::fs::write(&bin, "#!/bin/sh\n").unwrap();
        make_executable(&bin);
        (dir, bin)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn clean_instance_passes() {
        let (dir, bin) = setup_base();
        let registry = Arc::new(MemoryPortRegistry::new());
        registry.allocate(9050, crate::instance::Protocol::Tcp, "svc-1").unwrap();
        let verifier = IsolationVerifier::new(dir.path().to_path_buf(), registry);

        let report = verifier.verify(&instance(&bin, vec![PortSpec::tcp(9050)])).await;
        assert!(report.passed, "violations: {:?}", report.violations);
        assert!(report.violations.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn binary_outside_base_is_rejected() {
        let (dir, _) = setup_base();
        let outside = tempfile::tempdir().unwrap();
        let bin = outside.path().join("rogue");
        std::fs::write(&bin, "#!/bin/sh\n").unwrap();
        make_executable(&bin);

        let verifier =
            IsolationVerifier::new(dir.path().to_path_buf(), Arc::new(MemoryPortRegistry::new()));
        let report = verifier.verify(&instance(&bin, Vec::new())).await;

        assert!(!report.passed);
        assert!(report
            .violations
            .iter()
            .any(|v| v.layer == ViolationLayer::Directory && v.severity == Severity::Error));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_escape_is_rejected() {
        let (dir, _) = setup_base();
        let outside = tempfile::tempdir().unwrap();
        let target = outside.path().join("real");
        std::fs::write(&target, "#!/bin/sh\n").unwrap();
        make_executable(&target);
        let link = dir.path().join("sneaky");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let verifier =
            IsolationVerifier::new(dir.path().to_path_buf(), Arc::new(MemoryPortRegistry::new()));
        let report = verifier.verify(&instance(&link, Vec::new())).await;

        assert!(!report.passed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn world_writable_parent_is_rejected() {
        use std::os::unix::fs::PermissionsExt as _;
        let (dir, bin) = setup_base();
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o777)).unwrap();

        let verifier =
            IsolationVerifier::new(dir.path().to_path_buf(), Arc::new(MemoryPortRegistry::new()));
        let report = verifier.verify(&instance(&bin, Vec::new())).await;

        assert!(!report.passed);
        assert!(report
            .violations
            .iter()
            .any(|v| v.detail.contains("exceed 0750")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_executable_binary_is_rejected() {
        use std::os::unix::fs::PermissionsExt as _;
        let (dir, bin) = setup_base();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o640)).unwrap();

        let verifier =
            IsolationVerifier::new(dir.path().to_path_buf(), Arc::new(MemoryPortRegistry::new()));
        let report = verifier.verify(&instance(&bin, Vec::new())).await;

        assert!(!report.passed);
        assert!(report.violations.iter().any(|v| v.detail.contains("not executable")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn port_owned_by_other_instance_is_rejected() {
        let (dir, bin) = setup_base();
        let registry = Arc::new(MemoryPortRegistry::new());
        registry.allocate(9050, crate::instance::Protocol::Tcp, "svc-2").unwrap();

        let verifier = IsolationVerifier::new(dir.path().to_path_buf(), registry);
        let report = verifier.verify(&instance(&bin, vec![PortSpec::tcp(9050)])).await;

        assert!(!report.passed);
        let violation = report
            .violations
            .iter()
            .find(|v| v.layer == ViolationLayer::PortRegistry)
            .unwrap();
        assert_eq!(violation.severity, Severity::Error);
        assert!(violation.detail.contains("svc-2"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unallocated_port_is_rejected() {
        let (dir, bin) = setup_base();
        let verifier =
            IsolationVerifier::new(dir.path().to_path_buf(), Arc::new(MemoryPortRegistry::new()));
        let report = verifier.verify(&instance(&bin, vec![PortSpec::tcp(9051)])).await;

        assert!(!report.passed);
        assert!(report
            .violations
            .iter()
            .any(|v| v.layer == ViolationLayer::PortRegistry && v.detail.contains("not allocated")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn wildcard_listen_ip_is_rejected() {
        let (dir, bin) = setup_base();
        let verifier =
            IsolationVerifier::new(dir.path().to_path_buf(), Arc::new(MemoryPortRegistry::new()));
        let mut inst = instance(&bin, Vec::new());
        inst.listen_ip = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

        let report = verifier.verify(&inst).await;
        assert!(!report.passed);
        assert!(report
            .violations
            .iter()
            .any(|v| v.layer == ViolationLayer::IpBinding));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn report_is_complete_across_layers() {
        let (dir, bin) = setup_base();
        std::fs::remove_file(&bin).unwrap();
        let mut inst = instance(&bin, vec![PortSpec::tcp(9052)]);
        inst.listen_ip = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

        let verifier =
            IsolationVerifier::new(dir.path().to_path_buf(), Arc::new(MemoryPortRegistry::new()));
        let report = verifier.verify(&inst).await;

        // Directory, PortRegistry and IpBinding all report.
        assert!(report.violations.iter().any(|v| v.layer == ViolationLayer::Directory));
        assert!(report.violations.iter().any(|v| v.layer == ViolationLayer::PortRegistry));
        assert!(report.violations.iter().any(|v| v.layer == ViolationLayer::IpBinding));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn binding_check_accepts_declared_listener() {
        let (dir, bin) = setup_base();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let verifier =
            IsolationVerifier::new(dir.path().to_path_buf(), Arc::new(MemoryPortRegistry::new()));
        let inst = instance(&bin, vec![PortSpec::tcp(port)]);

        let report = verifier.verify_bindings(&inst, std::process::id());
        assert!(report.passed, "violations: {:?}", report.violations);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn binding_check_flags_undeclared_listener() {
        let (dir, bin) = setup_base();
        let _listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();

        let verifier =
            IsolationVerifier::new(dir.path().to_path_buf(), Arc::new(MemoryPortRegistry::new()));
        let inst = instance(&bin, Vec::new());

        let report = verifier.verify_bindings(&inst, std::process::id());
        assert!(!report.passed);
        assert!(report
            .violations
            .iter()
            .any(|v| v.layer == ViolationLayer::ProcessBinding
                && v.detail.contains("undeclared")));
    }
}
