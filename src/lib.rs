//! # Confidential VM disk unlock
//!
//! - [`sealed`] splits the TPM-unsealed blob into boot and root keys
//! - [`specialize`] pulls provisioning secrets out of a specialization archive
//! - [`agent`] answers the boot-time disk passphrase prompts with those keys
//!
//! ## Typical flow
//! ```bash
//! cvm-unlock split unsealed.bin --boot-key /var/lib/cvm/boot.key --root-key /var/lib/cvm/root.key
//! cvm-unlock password-agent /var/lib/cvm/boot.key /var/lib/cvm/root.key
//! ```

pub mod agent;
pub mod buf;
pub mod cli;
pub mod config;
pub mod keyfile;
pub mod sealed;
pub mod specialize;
