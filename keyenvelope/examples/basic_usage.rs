//! Basic usage example for `keyenvelope` with the local provider.

use std::path::PathBuf;
use std::sync::Arc;

use keyenvelope::prelude::*;
use keyenvelope_kms_local::{LocalKmsProvider, LocalProviderConfig};
use secrecy::{SecretString, SecretVec};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("keyenvelope Basic Usage Example");
    println!("===============================\n");

    // Created on first initialize
    let key_dir = PathBuf::from("./example_keys");
    let passphrase = SecretString::new("example-passphrase".to_string());

    let provider = Arc::new(LocalKmsProvider::new(LocalProviderConfig::new(&key_dir, passphrase)));
    provider.initialize().await?;
    let meta = provider.kek_metadata().await?;
    println!("✓ Local provider ready (KEK {} {})\n", meta.id, meta.version);

    let audit = Arc::new(MemoryAuditLog::new());
    let engine = EnvelopeEncryption::with_shared_provider(Arc::clone(&provider), audit.clone());

    let plaintext = b"alice@example.com";
    println!("Plaintext: {}", String::from_utf8_lossy(plaintext));

    let serialized = engine.encrypt_to_string(plaintext).await?;
    println!("✓ Encrypted envelope ({} bytes)", serialized.len());

    let decrypted = engine.decrypt_from_str(&serialized).await?;
    assert_eq!(plaintext, &decrypted.data[..]);
    println!("✓ Decrypted: {}\n", String::from_utf8_lossy(&decrypted.data));

    // Per-user keys need a master secret wrapped by the same provider
    let wrapped = PerUserKeyDerivation::provision_master_secret(provider.as_ref()).await?;
    let derivation = PerUserKeyDerivation::with_shared_provider(
        provider,
        wrapped,
        SecretVec::new(b"example-pepper".to_vec()),
        audit.clone(),
    );
    derivation.initialize().await?;

    let record = derivation.encrypt_for_user("user_1", b"secret")?;
    assert_eq!(derivation.decrypt_for_user("user_1", &record)?, b"secret");
    assert!(derivation.decrypt_for_user("user_2", &record).is_err());
    println!("✓ Per-user record only opens for its owner\n");

    println!("Audit trail:");
    for entry in audit.entries() {
        println!("  {} {} success={}", entry.timestamp, entry.operation, entry.success);
    }

    println!("\nNote: Key directory at {key_dir:?} can be deleted manually");

    Ok(())
}
