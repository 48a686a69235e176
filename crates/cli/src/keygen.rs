use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use agritrace_ledger::AccountSigner;

use crate::{report_error, OutputFormat};

/// Generate a ledger signing account and write it to files.
///
/// Writes `<prefix>.secret` (base64 32-byte Ed25519 seed, the format
/// `ledger.signing_key_path` expects) and `<prefix>.pub` (base64 verifying
/// key). The secret file is made owner-only on Unix.
pub fn cmd_keygen(algorithm: &str, output_prefix: &str, output: OutputFormat, quiet: bool) {
    if algorithm != "ed25519" {
        report_error(
            &format!(
                "error: unsupported algorithm '{}'; only 'ed25519' is supported",
                algorithm
            ),
            output,
            quiet,
        );
        std::process::exit(1);
    }

    let secret_path = format!("{}.secret", output_prefix);
    let pub_path = format!("{}.pub", output_prefix);
    let address = match write_keypair(Path::new(&secret_path), Path::new(&pub_path)) {
        Ok(address) => address,
        Err(e) => {
            report_error(&format!("error: {}", e), output, quiet);
            std::process::exit(1);
        }
    };

    if quiet {
        return;
    }
    match output {
        OutputFormat::Text => {
            println!("Generated ledger account {}", address);
            println!("  secret: {}", secret_path);
            println!("  public: {}", pub_path);
        }
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({
                "address": address,
                "secret": secret_path,
                "public": pub_path,
            })
        ),
    }
}

/// Write a fresh keypair and return the account address.
fn write_keypair(secret_path: &Path, pub_path: &Path) -> Result<String, String> {
    let signer = AccountSigner::generate();
    std::fs::write(secret_path, signer.to_base64()).map_err(|e| {
        format!(
            "writing secret key to '{}': {}",
            secret_path.display(),
            e
        )
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        if let Err(e) = std::fs::set_permissions(secret_path, perms) {
            tracing::warn!(path = %secret_path.display(), error = %e, "could not restrict secret key permissions");
        }
    }

    let public = BASE64.encode(signer.verifying_key().to_bytes());
    std::fs::write(pub_path, public)
        .map_err(|e| format!("writing public key to '{}': {}", pub_path.display(), e))?;
    Ok(signer.address().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn written_secret_loads_as_the_same_account() {
        let tmp = TempDir::new().unwrap();
        let secret = tmp.path().join("acct.secret");
        let public = tmp.path().join("acct.pub");

        let address = write_keypair(&secret, &public).unwrap();
        let loaded = AccountSigner::from_file(&secret).unwrap();
        assert_eq!(loaded.address(), address);

        let pub_bytes = BASE64
            .decode(std::fs::read_to_string(&public).unwrap().trim())
            .unwrap();
        assert_eq!(pub_bytes, loaded.verifying_key().to_bytes().to_vec());
    }

    #[cfg(unix)]
    #[test]
    fn secret_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = TempDir::new().unwrap();
        let secret = tmp.path().join("acct.secret");
        write_keypair(&secret, &tmp.path().join("acct.pub")).unwrap();
        let mode = std::fs::metadata(&secret).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn unwritable_location_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("no-such-dir").join("acct.secret");
        assert!(write_keypair(&missing, &tmp.path().join("acct.pub")).is_err());
    }
}
