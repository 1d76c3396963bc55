use std::fmt::{Display, Formatter};
use std::fs;
use std::io::{ErrorKind, Read};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::UpgradeFailure;

/// Strong one-way hash of a file's bytes, as lowercase hex.
pub trait ContentDigest: Send + Sync {
    fn hex_digest(&self, path: &Path) -> Result<String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Digest;

impl ContentDigest for Sha256Digest {
    fn hex_digest(&self, path: &Path) -> Result<String> {
        let mut file = fs::File::open(path)
            .with_context(|| format!("failed opening file {}", path.display()))?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = file
                .read(&mut buf)
                .with_context(|| format!("failed reading file {}", path.display()))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }
}

pub fn normalize_sha256_hex(raw: &str) -> Result<String> {
    let normalized = raw.trim().to_ascii_lowercase();
    if normalized.len() != 64 {
        return Err(anyhow!(
            "expected digest must be a 64-character SHA-256 hex string"
        ));
    }
    if !normalized.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return Err(anyhow!("expected digest must contain only hex characters"));
    }
    Ok(normalized)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryRole {
    Candidate,
    Active,
}

impl Display for BinaryRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BinaryRole::Candidate => write!(f, "candidate"),
            BinaryRole::Active => write!(f, "active"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Verified { digest_checked: bool },
    /// Only reachable for the active role (fresh install).
    Absent,
}

pub struct BinaryValidator {
    trusted_uid: u32,
    digest: Box<dyn ContentDigest>,
}

impl BinaryValidator {
    /// Trusts the effective uid of this process, hashing with SHA-256.
    pub fn for_current_user() -> Self {
        Self::new(nix::unistd::geteuid().as_raw(), Box::new(Sha256Digest))
    }

    pub fn new(trusted_uid: u32, digest: Box<dyn ContentDigest>) -> Self {
        Self {
            trusted_uid,
            digest,
        }
    }

    pub fn trusted_uid(&self) -> u32 {
        self.trusted_uid
    }

    pub fn validate_executable(
        &self,
        path: &Path,
        role: BinaryRole,
        expected_sha256: Option<&str>,
    ) -> Result<ValidationOutcome, UpgradeFailure> {
        let label = format!("{} executable", role);
        let exists = self
            .check_provenance(path, &label)
            .map_err(UpgradeFailure::from_config_error)?;

        if !exists {
            return match role {
                BinaryRole::Candidate => Err(UpgradeFailure::configuration(format!(
                    "candidate executable does not exist: {}",
                    path.display()
                ))),
                BinaryRole::Active => {
                    info!(
                        path = %path.display(),
                        "active executable absent; treating as fresh install"
                    );
                    Ok(ValidationOutcome::Absent)
                }
            };
        }

        let mut digest_checked = false;
        if role == BinaryRole::Candidate {
            if let Some(expected) = expected_sha256 {
                self.verify_digest(path, expected)
                    .map_err(UpgradeFailure::from_config_error)?;
                digest_checked = true;
            }
        }

        debug!(
            path = %path.display(),
            role = %role,
            digest_checked = digest_checked,
            "executable provenance verified"
        );
        Ok(ValidationOutcome::Verified { digest_checked })
    }

    /// The companion settings file must exist and pass the same provenance rules.
    pub fn validate_settings_file(&self, path: &Path) -> Result<(), UpgradeFailure> {
        let exists = self
            .check_provenance(path, "settings file")
            .map_err(UpgradeFailure::from_config_error)?;
        if !exists {
            return Err(UpgradeFailure::configuration(format!(
                "settings file does not exist: {}",
                path.display()
            )));
        }
        Ok(())
    }

    fn verify_digest(&self, path: &Path, expected: &str) -> Result<()> {
        let expected = normalize_sha256_hex(expected)?;
        let actual = self.digest.hex_digest(path)?.to_ascii_lowercase();
        if actual != expected {
            return Err(anyhow!(
                "candidate executable checksum mismatch for {} (expected {}, got {})",
                path.display(),
                expected,
                actual
            ));
        }
        Ok(())
    }

    /// Returns `false` when the path does not exist.
    fn check_provenance(&self, path: &Path, label: &str) -> Result<bool> {
        let metadata = match fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed reading {} metadata {}", label, path.display()));
            }
        };

        if metadata.file_type().is_symlink() {
            return Err(anyhow!(
                "{} {} is a symbolic link; refusing to follow it",
                label,
                path.display()
            ));
        }
        if !metadata.file_type().is_file() {
            return Err(anyhow!(
                "{} {} is not a regular file",
                label,
                path.display()
            ));
        }
        if metadata.uid() != self.trusted_uid {
            return Err(anyhow!(
                "{} {} is owned by uid {} but only uid {} is trusted",
                label,
                path.display(),
                metadata.uid(),
                self.trusted_uid
            ));
        }
        let mode = metadata.mode() & 0o7777;
        if mode & 0o022 != 0 {
            return Err(anyhow!(
                "{} {} has unsafe permissions (mode {:04o}); group/other write must be cleared",
                label,
                path.display(),
                mode
            ));
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        normalize_sha256_hex, BinaryRole, BinaryValidator, ContentDigest, Sha256Digest,
        ValidationOutcome,
    };
    use crate::error::FailureKind;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn write_executable(path: &Path, body: &str, mode: u32) {
        fs::write(path, body).expect("write binary");
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).expect("chmod");
    }

    #[test]
    fn sha256_of_known_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("abc");
        fs::write(&path, "abc").expect("write");
        let digest = Sha256Digest.hex_digest(&path).expect("digest");
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn normalize_rejects_short_and_non_hex_values() {
        assert!(normalize_sha256_hex("abc").is_err());
        assert!(normalize_sha256_hex(&"z".repeat(64)).is_err());
        let upper = "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD";
        assert_eq!(
            normalize_sha256_hex(&format!("  {}  ", upper)).expect("normalized"),
            upper.to_ascii_lowercase()
        );
    }

    #[test]
    fn missing_candidate_is_configuration_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let validator = BinaryValidator::for_current_user();
        let err = validator
            .validate_executable(&dir.path().join("nope"), BinaryRole::Candidate, None)
            .expect_err("missing candidate");
        assert_eq!(err.kind, FailureKind::Configuration);
        assert!(err.message.contains("does not exist"));
    }

    #[test]
    fn missing_active_is_tolerated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let validator = BinaryValidator::for_current_user();
        let outcome = validator
            .validate_executable(&dir.path().join("nope"), BinaryRole::Active, None)
            .expect("fresh install");
        assert_eq!(outcome, ValidationOutcome::Absent);
    }

    #[test]
    fn symlinked_active_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let real = dir.path().join("real");
        write_executable(&real, "bin", 0o755);
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).expect("symlink");

        let validator = BinaryValidator::for_current_user();
        let err = validator
            .validate_executable(&link, BinaryRole::Active, None)
            .expect_err("symlink must fail");
        assert_eq!(err.kind, FailureKind::Configuration);
        assert!(err.message.contains("symbolic link"));
    }

    #[test]
    fn group_writable_candidate_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("candidate");
        write_executable(&path, "bin", 0o775);

        let err = BinaryValidator::for_current_user()
            .validate_executable(&path, BinaryRole::Candidate, None)
            .expect_err("group write must fail");
        assert!(err.message.contains("unsafe permissions"));
    }

    #[test]
    fn foreign_owner_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("candidate");
        write_executable(&path, "bin", 0o755);

        let other_uid = nix::unistd::geteuid().as_raw().wrapping_add(1);
        let validator = BinaryValidator::new(other_uid, Box::new(Sha256Digest));
        let err = validator
            .validate_executable(&path, BinaryRole::Candidate, None)
            .expect_err("owner mismatch");
        assert!(err.message.contains("only uid"));
    }

    #[test]
    fn directory_is_not_a_regular_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = BinaryValidator::for_current_user()
            .validate_executable(dir.path(), BinaryRole::Candidate, None)
            .expect_err("directory");
        assert!(err.message.contains("not a regular file"));
    }

    #[test]
    fn digest_mismatch_is_fatal_and_match_passes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("candidate");
        write_executable(&path, "abc", 0o755);
        let validator = BinaryValidator::for_current_user();

        let ok = validator
            .validate_executable(
                &path,
                BinaryRole::Candidate,
                Some("BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD"),
            )
            .expect("digest match");
        assert_eq!(
            ok,
            ValidationOutcome::Verified {
                digest_checked: true
            }
        );

        let err = validator
            .validate_executable(&path, BinaryRole::Candidate, Some(&"0".repeat(64)))
            .expect_err("digest mismatch");
        assert_eq!(err.kind, FailureKind::Configuration);
        assert!(err.message.contains("checksum mismatch"));
    }

    #[test]
    fn validation_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let good = dir.path().join("good");
        let bad = dir.path().join("bad");
        write_executable(&good, "bin", 0o755);
        write_executable(&bad, "bin", 0o777);
        let validator = BinaryValidator::for_current_user();

        for _ in 0..2 {
            assert!(validator
                .validate_executable(&good, BinaryRole::Candidate, None)
                .is_ok());
            assert!(validator
                .validate_executable(&bad, BinaryRole::Candidate, None)
                .is_err());
        }
    }

    #[test]
    fn settings_file_must_exist_and_be_private_enough() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("upgrade.env");
        let validator = BinaryValidator::for_current_user();
        assert!(validator.validate_settings_file(&path).is_err());

        write_executable(&path, "HEIGHT_UPGRADE_TARGET_HEIGHT=10\n", 0o600);
        validator.validate_settings_file(&path).expect("safe file");

        fs::set_permissions(&path, fs::Permissions::from_mode(0o666)).expect("chmod");
        assert!(validator.validate_settings_file(&path).is_err());
    }
}
