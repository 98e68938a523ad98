//! CLI command definitions and handlers.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, bail, eyre};
use stevedore_common::StevedorePaths;
use stevedore_image::archive::{ArchiveInput, ArchiveOutput, Archiver, NativeTar};
use stevedore_image::repository::Writability;
use stevedore_image::{
    ContainerBuilder, ImageSpec, LocalRepository, PlatformSelector, PortableImages, PullPolicy,
    RegistryClient, RegistryConfig,
};

/// Stevedore - Daemonless Container Image Manager
#[derive(Parser)]
#[command(name = "stevedore")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Root directory for stevedore data (default: ~/.stevedore)
    #[arg(long, global = true, env = "STEVEDORE_DIR")]
    pub root: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "debug")]
    pub quiet: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Image and container commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Pull an image from a registry
    Pull {
        /// Platform as os[/arch[/variant]] (default: host)
        #[arg(long)]
        platform: Option<String>,

        /// Registry URL to use instead of Docker Hub
        #[arg(long)]
        registry: Option<String>,

        /// Index URL to use instead of Docker Hub
        #[arg(long)]
        index: Option<String>,

        /// Layer pull policy (missing, always, never)
        #[arg(long = "pull", default_value = "missing")]
        policy: PullPolicy,

        /// Image as repo[:tag]
        image: String,
    },

    /// Create a container from an image
    Create {
        /// Name for the new container
        #[arg(long)]
        name: Option<String>,

        /// Take the name over from another container
        #[arg(short, long)]
        force: bool,

        /// Image as repo[:tag]
        image: String,
    },

    /// Import a filesystem tarball as an image
    Import {
        /// Platform as os[/arch[/variant]] (default: host)
        #[arg(long)]
        platform: Option<String>,

        /// Tar file, or - for stdin
        tarball: String,

        /// Image as repo[:tag]
        image: String,
    },

    /// Export a container's filesystem as a tarball
    Export {
        /// Output file, or - for stdout
        #[arg(short, long)]
        output: String,

        /// Container name or ID
        container: String,
    },

    /// Load images from a saved archive
    Load {
        /// Input file, or - for stdin
        #[arg(short, long, default_value = "-")]
        input: String,

        /// Store every image under this repository
        repository: Option<String>,
    },

    /// Save images to an archive
    Save {
        /// Output file, or - for stdout
        #[arg(short, long, default_value = "-")]
        output: String,

        /// Images as repo[:tag]
        #[arg(required = true)]
        images: Vec<String>,
    },

    /// Show the config of an image or container
    Inspect {
        /// Print the directory instead
        #[arg(short = 'p', long)]
        print_dir: bool,

        /// Image or container
        target: String,
    },

    /// Check that an image's layers are present and readable
    Verify {
        /// Image as repo[:tag]
        image: String,
    },

    /// Registry manifest operations
    Manifest {
        /// Manifest subcommand.
        #[command(subcommand)]
        command: ManifestCommand,
    },

    /// List containers
    Ps,

    /// List images
    Images {
        /// Also list layer files
        #[arg(short, long)]
        long: bool,

        /// Show the image platform
        #[arg(short, long)]
        platform: bool,
    },

    /// Delete containers
    Rm {
        /// Container names or IDs
        #[arg(required = true)]
        containers: Vec<String>,
    },

    /// Delete an image
    Rmi {
        /// Delete even if protected
        #[arg(short, long)]
        force: bool,

        /// Image as repo[:tag]
        image: String,
    },

    /// Rename a container
    Rename {
        /// Current container name
        name: String,

        /// New container name
        new_name: String,
    },

    /// Protect an image or container from deletion
    Protect {
        /// Image or container
        target: String,
    },

    /// Remove deletion protection
    Unprotect {
        /// Image or container
        target: String,
    },
}

/// `manifest` subcommands.
#[derive(Subcommand)]
pub enum ManifestCommand {
    /// Print the registry manifest of an image
    Inspect {
        /// Platform to resolve a manifest list to
        #[arg(long)]
        platform: Option<String>,

        /// Registry URL to use instead of Docker Hub
        #[arg(long)]
        registry: Option<String>,

        /// Image as repo[:tag]
        image: String,
    },
}

impl Cli {
    /// Default `tracing` directive for the chosen verbosity.
    #[must_use]
    pub const fn log_directive(&self) -> &'static str {
        if self.debug {
            "stevedore=debug,stevedore_image=debug"
        } else if self.quiet {
            "error"
        } else {
            "stevedore=info,stevedore_image=info"
        }
    }

    /// Execute the CLI command.
    ///
    /// # Errors
    ///
    /// Returns any failure of the command; `main` reports it.
    pub async fn execute(self) -> Result<()> {
        let paths = self
            .root
            .map_or_else(StevedorePaths::new, StevedorePaths::with_root);
        let repo = LocalRepository::new(paths);
        repo.ensure_layout()?;

        match self.command {
            Commands::Pull {
                platform,
                registry,
                index,
                policy,
                image,
            } => {
                let image = ImageSpec::parse(&image)?;
                let platform = platform.as_deref().map(PlatformSelector::parse);
                let config = registry_config(registry.as_deref(), index.as_deref());
                let mut client = RegistryClient::new(repo, config)?;
                let files = client.pull(&image, platform.as_ref(), policy).await?;
                tracing::info!(image = %image, blobs = files.len(), "Pull complete");
                Ok(())
            }

            Commands::Create { name, force, image } => {
                create(&repo, name.as_deref(), force, &image)
            }

            Commands::Import {
                platform,
                tarball,
                image,
            } => {
                let image = ImageSpec::parse(&image)?;
                let platform = platform.as_deref().map(PlatformSelector::parse);
                PortableImages::new(&repo).import_tar(
                    &ArchiveInput::from_arg(&tarball),
                    &image,
                    platform.as_ref(),
                )?;
                println!("{image}");
                Ok(())
            }

            Commands::Export { output, container } => {
                PortableImages::new(&repo)
                    .export_container(&container, &ArchiveOutput::from_arg(&output))?;
                Ok(())
            }

            Commands::Load { input, repository } => {
                let loaded = PortableImages::new(&repo)
                    .load(&ArchiveInput::from_arg(&input), repository.as_deref())?;
                if loaded.is_empty() {
                    bail!("no images loaded");
                }
                for image in loaded {
                    println!("{image}");
                }
                Ok(())
            }

            Commands::Save { output, images } => {
                let images = images
                    .iter()
                    .map(|i| ImageSpec::parse(i))
                    .collect::<Result<Vec<_>, _>>()?;
                let saved = PortableImages::new(&repo)
                    .save(&images, &ArchiveOutput::from_arg(&output))?;
                tracing::info!(images = saved.len(), "Saved images");
                Ok(())
            }

            Commands::Inspect { print_dir, target } => inspect(&repo, print_dir, &target),

            Commands::Verify { image } => {
                let image = ImageSpec::parse(&image)?;
                let tag = repo.require_tag(&image.repository, &image.tag)?;
                tag.verify()?;
                let attrs = tag
                    .image_attributes()?
                    .ok_or_else(|| eyre!("{image}: layer files unavailable"))?;
                for layer in &attrs.layers {
                    NativeTar
                        .list(&ArchiveInput::File(layer.clone()))
                        .map_err(|e| eyre!("{image}: layer {} is unreadable: {e}", layer.display()))?;
                }
                println!("{image}: ok");
                Ok(())
            }

            Commands::Manifest {
                command:
                    ManifestCommand::Inspect {
                        platform,
                        registry,
                        image,
                    },
            } => {
                let image = ImageSpec::parse(&image)?;
                let platform = platform.as_deref().map(PlatformSelector::parse);
                let mut client = RegistryClient::new(repo, registry_config(registry.as_deref(), None))?;
                let remote = client.resolve(&image.repository);
                let response = client
                    .fetch_manifest(&remote.repository, &image.tag, platform.as_ref())
                    .await?;
                let manifest = response
                    .manifest
                    .ok_or_else(|| eyre!("no manifest for {image} (HTTP {})", response.status))?;
                println!("{}", serde_json::to_string_pretty(&manifest)?);
                Ok(())
            }

            Commands::Ps => {
                println!("{:<36} P M {:<20} IMAGE", "CONTAINER ID", "NAMES");
                for container in repo.list_containers()? {
                    let protected = if repo.is_container_protected(&container.id) { 'P' } else { '.' };
                    let mode = match repo.is_writable_container(&container.id) {
                        Writability::Writable => 'W',
                        Writability::ReadOnly => 'R',
                        Writability::Missing => 'N',
                    };
                    println!(
                        "{:<36} {protected} {mode} {:<20} {}",
                        container.id,
                        container.names.join(","),
                        container.image
                    );
                }
                Ok(())
            }

            Commands::Images { long, platform } => {
                println!("REPOSITORY");
                for (repository, tag) in repo.list_image_repos()? {
                    let Some(tag_dir) = repo.select_tag(&repository, &tag) else {
                        continue;
                    };
                    let protected = if tag_dir.is_protected() { 'P' } else { '.' };
                    if platform {
                        println!(
                            "{:<40} {protected} {}",
                            tag_dir.reference(),
                            tag_dir.platform_label()
                        );
                    } else {
                        println!("{:<40} {protected}", tag_dir.reference());
                    }
                    if long {
                        for layer in tag_dir.layers()? {
                            println!(
                                "    {} ({} MB)",
                                layer.path.display(),
                                layer.size.div_ceil(1024 * 1024)
                            );
                        }
                    }
                }
                Ok(())
            }

            Commands::Rm { containers } => {
                let mut failed = 0;
                for container in &containers {
                    let result = repo
                        .container_id(container)
                        .ok_or_else(|| eyre!("container not found: {container}"))
                        .and_then(|id| Ok(repo.remove_container(&id, false)?));
                    if let Err(e) = result {
                        tracing::error!(container = %container, error = %e, "Cannot delete container");
                        failed += 1;
                    }
                }
                if failed > 0 {
                    bail!("{failed} of {} containers not deleted", containers.len());
                }
                Ok(())
            }

            Commands::Rmi { force, image } => {
                let image = ImageSpec::parse(&image)?;
                repo.remove_image(&image.repository, &image.tag, force)?;
                println!("{image}");
                Ok(())
            }

            Commands::Rename { name, new_name } => rename(&repo, &name, &new_name),

            Commands::Protect { target } => set_protection(&repo, &target, true),

            Commands::Unprotect { target } => set_protection(&repo, &target, false),
        }
    }
}

/// Registry settings with optional endpoint overrides.
fn registry_config(registry: Option<&str>, index: Option<&str>) -> RegistryConfig {
    let mut config = RegistryConfig::default();
    if let Some(registry) = registry {
        config.set_registry(registry);
        if index.is_none() {
            config.set_index(registry);
        }
    }
    if let Some(index) = index {
        config.set_index(index);
    }
    config
}

fn create(repo: &LocalRepository, name: Option<&str>, force: bool, image: &str) -> Result<()> {
    let image = ImageSpec::parse(image)?;
    // A name held by another container is released only with --force.
    let taken = name.filter(|n| repo.container_id(n).is_some() && repo.container_dir(n).is_none());
    if let Some(name) = taken {
        if !force {
            bail!("container name already in use: {name}");
        }
        repo.delete_container_name(name)?;
    }

    let id = ContainerBuilder::new(repo).create_from_image(&image.repository, &image.tag, None)?;
    if let Some(name) = name {
        repo.set_container_name(id.as_str(), name)?;
    }
    println!("{id}");
    Ok(())
}

fn inspect(repo: &LocalRepository, print_dir: bool, target: &str) -> Result<()> {
    if let Some(id) = repo.container_id(target) {
        if print_dir {
            println!("{}", repo.paths().container_root(&id).display());
            return Ok(());
        }
        let config = repo
            .container_json(&id)?
            .ok_or_else(|| eyre!("container {target} has no config"))?;
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let image = ImageSpec::parse(target)?;
    let tag = repo.require_tag(&image.repository, &image.tag)?;
    if print_dir {
        println!("{}", tag.path().display());
        return Ok(());
    }
    let config = tag
        .image_attributes()?
        .and_then(|attrs| attrs.config)
        .ok_or_else(|| eyre!("{image}: no image config"))?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn rename(repo: &LocalRepository, name: &str, new_name: &str) -> Result<()> {
    let id = repo
        .container_id(name)
        .ok_or_else(|| eyre!("container not found: {name}"))?;
    if repo.container_dir(name).is_some() {
        bail!("{name} is a container id, not a name");
    }
    if repo.container_id(new_name).is_some() {
        bail!("container name already in use: {new_name}");
    }

    repo.delete_container_name(name)?;
    if let Err(e) = repo.set_container_name(&id, new_name) {
        tracing::error!(name = new_name, error = %e, "Rename failed, restoring old name");
        repo.set_container_name(&id, name)?;
        return Err(e.into());
    }
    Ok(())
}

fn set_protection(repo: &LocalRepository, target: &str, protect: bool) -> Result<()> {
    if let Some(id) = repo.container_id(target) {
        repo.set_container_protected(&id, protect)?;
        return Ok(());
    }
    let image = ImageSpec::parse(target)?;
    let tag = repo.require_tag(&image.repository, &image.tag)?;
    if protect {
        tag.protect()?;
    } else {
        tag.unprotect()?;
    }
    Ok(())
}
