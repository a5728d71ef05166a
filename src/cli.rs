use crate::agent::InitialAgent;
use crate::config::AgentConfig;
use crate::keyfile::{read_secret, write_secret};
use crate::sealed;
use crate::specialize::{self, SpecializationFile};
use clap::{Parser, Subcommand};
use eyre::{bail, eyre, Result, WrapErr};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

const CONFIG_ENV_VAR: &str = "CVM_UNLOCK_CONFIG";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Split an unsealed key blob into boot and root key files
    Split {
        /// Raw blob produced by the TPM unseal step
        #[arg(value_name = "blob")]
        blob: PathBuf,
        #[arg(long, value_name = "path")]
        boot_key: PathBuf,
        #[arg(long, value_name = "path")]
        root_key: PathBuf,
    },
    /// Combine boot and root key files into a key blob
    Combine {
        #[arg(long, value_name = "path")]
        boot_key: PathBuf,
        #[arg(long, value_name = "path")]
        root_key: PathBuf,
        #[arg(value_name = "out")]
        output: PathBuf,
    },
    /// Extract the files carried by a decrypted specialization archive
    Extract {
        #[arg(value_name = "archive")]
        archive: PathBuf,
        /// Directory receiving one file per entry
        #[arg(value_name = "dir", required_unless_present = "list")]
        out_dir: Option<PathBuf>,
        /// Print entry names, sizes and SHA-256 digests instead
        #[arg(short, long)]
        list: bool,
    },
    /// Build a specialization archive, naming entries after the input files
    Pack {
        #[arg(value_name = "out")]
        output: PathBuf,
        #[arg(value_name = "file", required = true)]
        files: Vec<PathBuf>,
    },
    /// Answer disk passphrase prompts with the persisted keys
    PasswordAgent {
        #[arg(value_name = "boot key")]
        boot_key: PathBuf,
        #[arg(value_name = "root key")]
        root_key: PathBuf,
        /// YAML agent configuration
        #[arg(short, long, env = CONFIG_ENV_VAR)]
        config: Option<PathBuf>,
    },
}

/// Rejects entry names that would escape the output directory.
fn entry_file_name(name: &str) -> Result<&str> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
        bail!("refusing to write entry named {:?}", name);
    }
    Ok(name)
}

impl Cli {
    pub fn new() -> Self {
        Cli::parse()
    }

    pub fn run(&self) -> Result<&Self> {
        log::debug!("{:?}", self);
        match &self.command {
            Commands::Split {
                blob,
                boot_key,
                root_key,
            } => split(blob, boot_key, root_key)?,
            Commands::Combine {
                boot_key,
                root_key,
                output,
            } => combine(boot_key, root_key, output)?,
            Commands::Extract {
                archive,
                out_dir,
                list,
            } => match (list, out_dir) {
                (true, _) => list_archive(archive)?,
                (false, Some(out_dir)) => extract(archive, out_dir)?,
                (false, None) => bail!("no output directory given"),
            },
            Commands::Pack { output, files } => pack(output, files)?,
            Commands::PasswordAgent {
                boot_key,
                root_key,
                config,
            } => {
                let config = match config {
                    Some(path) => AgentConfig::load(path)?,
                    None => AgentConfig::default(),
                };
                InitialAgent::new(config, boot_key, root_key)
                    .watch()
                    .wrap_err("password agent could not start")?
                    .run()
            }
        };
        Ok(self)
    }
}

fn split(blob: &Path, boot_key: &Path, root_key: &Path) -> Result<()> {
    let blob = read_secret(blob)?;
    let keys = sealed::split(&blob).wrap_err("invalid sealed key blob")?;
    write_secret(boot_key, &keys.boot)?;
    write_secret(root_key, &keys.root)?;
    log::info!(
        "split {:?} into {} and {}",
        keys,
        boot_key.display(),
        root_key.display()
    );
    Ok(())
}

fn combine(boot_key: &Path, root_key: &Path, output: &Path) -> Result<()> {
    let boot = read_secret(boot_key)?;
    let root = read_secret(root_key)?;
    let blob = sealed::combine(&boot, &root)?;
    write_secret(output, &blob)?;
    log::info!("wrote {} byte key blob to {}", blob.len(), output.display());
    Ok(())
}

fn list_archive(archive: &Path) -> Result<()> {
    let files = specialize::extract(&read_secret(archive)?)?;
    for file in &files {
        println!(
            "{}\t{}\t{}",
            hex::encode(Sha256::digest(&file.payload[..])),
            file.payload.len(),
            file.name
        );
    }
    specialize::release(files);
    Ok(())
}

fn extract(archive: &Path, out_dir: &Path) -> Result<()> {
    let files = specialize::extract(&read_secret(archive)?)
        .wrap_err_with(|| format!("invalid specialization archive {}", archive.display()))?;
    for file in &files {
        let path = out_dir.join(entry_file_name(&file.name)?);
        write_secret(&path, &file.payload)?;
        log::info!("extracted {}", path.display());
    }
    specialize::release(files);
    Ok(())
}

fn pack(output: &Path, inputs: &[PathBuf]) -> Result<()> {
    let mut files = Vec::with_capacity(inputs.len());
    for input in inputs {
        let name = input
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| eyre!("{} has no usable file name", input.display()))?;
        let payload = read_secret(input)?;
        files.push(SpecializationFile::new(name, payload.as_slice()));
    }
    let archive = specialize::combine(&files)?;
    specialize::release(files);
    write_secret(output, &archive)?;
    log::info!("packed {} files into {}", inputs.len(), output.display());
    Ok(())
}
