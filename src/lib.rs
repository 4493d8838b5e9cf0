//! Routeforge: a content-addressed deployment and manifest-routing control plane.
//!
//! Two cooperating subsystems form the core:
//!
//! - **Deployment engine**: places immutable code units at addresses computed
//!   in advance from the engine identity, a caller-supplied salt, and the
//!   content hash. Staged chunks bypass the per-publish size ceiling; fees
//!   are checked with exact refund of overpayment; an integrity guard halts
//!   deploys if the engine or its authoritative manifest is substituted.
//! - **Manifest router**: the authoritative selector→implementation mapping,
//!   advanced only through a role-gated, timelocked commit→apply→activate
//!   state machine. Every applied route is verified by an ordered-proof
//!   Merkle membership proof against the committed root, and resolution
//!   fails closed when a target's code hash drifts from the recorded one.
//!
//! All state lives in a per-instance store (`.routeforge/data`): one sqlite
//! database plus an append-only JSONL transition log for audit tooling.
//! Independent instances coordinate through nothing but deterministic
//! inputs — identical salts and code yield identical addresses everywhere.
//!
//! # Crate structure
//!
//! - [`core`]: verifier, engine, router, salt derivation, shared primitives
//! - CLI wrappers in this module ([`run`])

pub mod core;

use core::config::{load_config, write_default_config, ForgeConfig};
use core::db::initialize_forge_db;
use core::engine::{
    engine_code_digest, BatchOutcomeSummary, DeployEngine, DeployRequest, IntegrityGuard,
};
use core::error::ForgeError;
use core::hash::{Digest, Salt, Selector};
use core::manifest::{Manifest, Route};
use core::roles::Permission;
use core::router::Router;
use core::salt::universal_salt;
use core::store::Store;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[clap(
    name = "routeforge",
    version = env!("CARGO_PKG_VERSION"),
    about = "Content-addressed deployment and timelocked manifest routing"
)]
struct Cli {
    /// Principal attributed to every mutating operation.
    #[clap(long, global = true, default_value = "operator")]
    actor: String,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize a deployment instance in the current directory
    #[clap(name = "init")]
    Init {
        /// Directory to initialize (defaults to current working directory).
        #[clap(short, long)]
        dir: Option<PathBuf>,
    },

    /// Derive a cross-target universal salt
    #[clap(name = "salt")]
    Salt {
        #[clap(long)]
        deployer: String,
        /// Content file to hash (or pass --content-hash).
        #[clap(long, conflicts_with = "content_hash")]
        file: Option<PathBuf>,
        #[clap(long)]
        content_hash: Option<String>,
        #[clap(long, default_value = "1")]
        version: u32,
        #[clap(long, default_value = "0")]
        nonce: u64,
    },

    /// Deployment engine: predict, stage, deploy
    #[clap(name = "deploy")]
    Deploy(DeployCli),

    /// Manifest tooling: build, inspect
    #[clap(name = "manifest")]
    Manifest(ManifestCli),

    /// Router state machine: commit, apply, activate, resolve
    #[clap(name = "router")]
    Router(RouterCli),

    /// Role assignments gating mutating operations
    #[clap(name = "role")]
    Role(RoleCli),

    /// Show the transition audit log
    #[clap(name = "audit")]
    Audit,

    /// Show version information
    #[clap(name = "version")]
    Version,
}

#[derive(clap::Args, Debug)]
struct DeployCli {
    #[clap(subcommand)]
    command: DeployCommand,
}

#[derive(Subcommand, Debug)]
enum DeployCommand {
    /// Predict the address deploy would produce, without deploying
    Predict {
        #[clap(long)]
        salt: String,
        #[clap(long, conflicts_with = "code_hash")]
        file: Option<PathBuf>,
        #[clap(long)]
        code_hash: Option<String>,
    },
    /// Stage a content chunk (idempotent, deduplicated by hash)
    Stage {
        #[clap(long)]
        file: PathBuf,
    },
    /// Deploy one code unit
    Run {
        #[clap(long)]
        salt: String,
        #[clap(long)]
        file: PathBuf,
        #[clap(long)]
        fee: u64,
    },
    /// Assemble staged chunks into one logical unit and deploy it
    Chunked {
        #[clap(long)]
        salt: String,
        /// Chunk hashes in assembly order.
        #[clap(long, required = true, num_args = 1..)]
        chunk: Vec<String>,
        #[clap(long)]
        fee: u64,
    },
    /// Deploy a batch described by a JSON spec file
    Batch {
        #[clap(long)]
        spec: PathBuf,
        /// All-or-nothing instead of best-effort per-item results.
        #[clap(long)]
        atomic: bool,
    },
    /// Show the accumulated fee-recipient balance
    Fees,
    /// Lift an integrity halt after resolving the mismatch
    ClearHalt,
}

#[derive(clap::Args, Debug)]
struct ManifestCli {
    #[clap(subcommand)]
    command: ManifestCommand,
}

#[derive(Subcommand, Debug)]
enum ManifestCommand {
    /// Build a manifest (routes JSON in, manifest JSON out)
    Build {
        /// JSON array of {selector, address, code_hash}.
        #[clap(long)]
        routes: PathBuf,
        #[clap(long)]
        version: String,
        #[clap(long)]
        epoch: u64,
        #[clap(long)]
        out: PathBuf,
    },
    /// Validate a manifest file and show its root and hash
    Show {
        #[clap(long)]
        file: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct RouterCli {
    #[clap(subcommand)]
    command: RouterCommand,
}

#[derive(Subcommand, Debug)]
enum RouterCommand {
    /// Commit a manifest root, starting the timelock
    Commit {
        #[clap(long)]
        manifest: PathBuf,
    },
    /// Verify and stage routes from a manifest against the pending root
    Apply {
        #[clap(long)]
        manifest: PathBuf,
        /// Apply a single selector (hex); default applies every route.
        #[clap(long)]
        selector: Option<String>,
    },
    /// Promote the fully applied set to live
    Activate,
    /// Abandon the pending commitment
    Cancel,
    /// Block all mutation (resolution stays available)
    Pause,
    /// Resume mutation
    Unpause,
    /// Resolve a selector to its implementing address
    Resolve {
        #[clap(long)]
        selector: String,
    },
    /// List all active selector→address bindings
    Routes,
    /// List all addresses serving any selector
    Implementations,
    /// Show the state machine's status
    Status,
    /// Show activation audit records
    Activations,
}

#[derive(clap::Args, Debug)]
struct RoleCli {
    #[clap(subcommand)]
    command: RoleCommand,
}

#[derive(Subcommand, Debug)]
enum RoleCommand {
    /// Grant a permission to a principal
    Grant {
        #[clap(long)]
        principal: String,
        #[clap(long)]
        permission: String,
    },
    /// Revoke a permission from a principal
    Revoke {
        #[clap(long)]
        principal: String,
        #[clap(long)]
        permission: String,
    },
    /// List all role assignments
    List,
}

fn find_forge_project_root(start_dir: &Path) -> Result<PathBuf, ForgeError> {
    let mut current_dir = PathBuf::from(start_dir);
    loop {
        if current_dir.join(".routeforge").exists() {
            return Ok(current_dir);
        }
        if !current_dir.pop() {
            return Err(ForgeError::NotFound(
                "'.routeforge' directory not found in current or parent directories. Run `routeforge init` first.".to_string(),
            ));
        }
    }
}

struct Instance {
    store: Store,
    config: ForgeConfig,
}

impl Instance {
    fn open(project_root: &Path) -> Result<Self, ForgeError> {
        let forge_root = project_root.join(".routeforge");
        let config = load_config(&forge_root)?;
        let store = Store::new(forge_root.join("data"));
        Ok(Self { store, config })
    }

    /// Engine guarded by this build's identity digest and the manifest hash
    /// the router currently treats as authoritative (pending commitment,
    /// else last activation). Before any commit the manifest arm is inert.
    fn engine(&self) -> Result<DeployEngine, ForgeError> {
        let expected_manifest_hash = self.router().state()?.authoritative_manifest_hash();
        let guard = IntegrityGuard {
            expected_engine_code: engine_code_digest(&self.config.engine_id),
            expected_manifest_hash,
        };
        Ok(DeployEngine::open(
            self.store.clone(),
            self.config.clone(),
            Some(guard),
        ))
    }

    fn router(&self) -> Router {
        Router::open(
            self.store.clone(),
            self.config.clone(),
            Arc::new(core::clock::SystemClock),
        )
    }
}

fn run_init(dir: Option<PathBuf>) -> Result<(), ForgeError> {
    let target_dir = match dir {
        Some(d) => d,
        None => std::env::current_dir()?,
    };
    let target_dir = std::fs::canonicalize(&target_dir).map_err(ForgeError::IoError)?;
    let forge_root = target_dir.join(".routeforge");
    let already = forge_root.exists();

    std::fs::create_dir_all(forge_root.join("data")).map_err(ForgeError::IoError)?;
    write_default_config(&forge_root)?;
    initialize_forge_db(&forge_root.join("data"))?;

    let instance = Instance::open(&target_dir)?;
    if already {
        println!(
            "    {} {} {}",
            "✓".bright_green(),
            "forge.db".bright_white(),
            "(preserved - existing data kept)".bright_black()
        );
    } else {
        instance.engine()?.initialize()?;
        instance.router().initialize()?;
        println!("    {} {}", "●".bright_green(), "forge.db".bright_white());
        println!("    {} {}", "●".bright_green(), "forge.toml".bright_white());
        println!(
            "    {} bootstrap admin: {}",
            "●".bright_green(),
            instance.config.bootstrap_admin.bright_cyan()
        );
    }
    println!(
        "Routeforge instance ready at {}",
        forge_root.display().to_string().bright_white()
    );
    Ok(())
}

fn read_content(file: &Path) -> Result<Vec<u8>, ForgeError> {
    std::fs::read(file).map_err(ForgeError::IoError)
}

fn content_digest(file: Option<&Path>, hash: Option<&str>) -> Result<Digest, ForgeError> {
    match (file, hash) {
        (Some(path), None) => Ok(Digest::of(&read_content(path)?)),
        (None, Some(hex)) => Digest::from_hex(hex),
        _ => Err(ForgeError::Validation(
            "pass exactly one of --file or --content-hash".to_string(),
        )),
    }
}

#[derive(serde::Deserialize, Debug)]
struct BatchItemSpec {
    salt: String,
    file: PathBuf,
    fee: u64,
}

pub fn run() -> Result<(), ForgeError> {
    let cli = Cli::parse();
    let actor = cli.actor.clone();

    if let Command::Version = cli.command {
        println!("v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }
    if let Command::Init { dir } = cli.command {
        return run_init(dir);
    }
    if let Command::Salt {
        deployer,
        file,
        content_hash,
        version,
        nonce,
    } = &cli.command
    {
        let digest = content_digest(file.as_deref(), content_hash.as_deref())?;
        let salt = universal_salt(deployer, &digest, *version, *nonce);
        println!("{}", salt);
        return Ok(());
    }
    if let Command::Manifest(manifest_cli) = &cli.command {
        return run_manifest_cli(manifest_cli);
    }

    let current_dir = std::env::current_dir()?;
    let project_root = find_forge_project_root(&current_dir)?;
    let instance = Instance::open(&project_root)?;

    match cli.command {
        Command::Deploy(deploy_cli) => run_deploy_cli(&instance, &actor, deploy_cli)?,
        Command::Router(router_cli) => run_router_cli(&instance, &actor, router_cli)?,
        Command::Role(role_cli) => run_role_cli(&instance, &actor, role_cli)?,
        Command::Audit => {
            let log_path = instance.store.event_log_path();
            if log_path.exists() {
                let content = std::fs::read_to_string(log_path)?;
                print!("{}", content);
            } else {
                println!("No audit log found.");
            }
        }
        _ => unreachable!(),
    }
    Ok(())
}

fn run_deploy_cli(instance: &Instance, actor: &str, cli: DeployCli) -> Result<(), ForgeError> {
    let engine = instance.engine()?;
    match cli.command {
        DeployCommand::Predict {
            salt,
            file,
            code_hash,
        } => {
            let salt = Salt::from_hex(&salt)?;
            let digest = content_digest(file.as_deref(), code_hash.as_deref())?;
            println!("{}", engine.predict(&salt, &digest));
        }
        DeployCommand::Stage { file } => {
            let content = read_content(&file)?;
            let chunk = engine.stage(actor, &content)?;
            println!("Staged chunk {} ({} bytes)", chunk.hash, chunk.size);
        }
        DeployCommand::Run { salt, file, fee } => {
            let salt = Salt::from_hex(&salt)?;
            let content = read_content(&file)?;
            let outcome = engine.deploy(actor, &salt, &content, fee)?;
            if outcome.placed {
                println!(
                    "{} Deployed {} (code hash {}, refund {})",
                    "●".bright_green(),
                    outcome.address,
                    outcome.code_hash,
                    outcome.refund
                );
            } else {
                println!(
                    "{} Already deployed at {} (refund {})",
                    "✓".bright_green(),
                    outcome.address,
                    outcome.refund
                );
            }
        }
        DeployCommand::Chunked { salt, chunk, fee } => {
            let salt = Salt::from_hex(&salt)?;
            let hashes = chunk
                .iter()
                .map(|h| Digest::from_hex(h))
                .collect::<Result<Vec<_>, _>>()?;
            let outcome = engine.deploy_chunked(actor, &salt, &hashes, fee)?;
            println!(
                "{} Deployed assembled unit at {} (refund {})",
                "●".bright_green(),
                outcome.address,
                outcome.refund
            );
        }
        DeployCommand::Batch { spec, atomic } => {
            let raw = std::fs::read_to_string(&spec)?;
            let items: Vec<BatchItemSpec> = serde_json::from_str(&raw)
                .map_err(|e| ForgeError::Validation(format!("batch spec parse: {}", e)))?;
            let mut requests = Vec::with_capacity(items.len());
            for item in &items {
                requests.push(DeployRequest {
                    salt: Salt::from_hex(&item.salt)?,
                    content: read_content(&item.file)?,
                    fee_paid: item.fee,
                });
            }
            let outcomes = engine.deploy_batch(actor, &requests, atomic)?;
            let summary = BatchOutcomeSummary::from(&outcomes);
            for (item, outcome) in items.iter().zip(outcomes.iter()) {
                match outcome {
                    Ok(o) => println!(
                        "{} {} -> {} (refund {})",
                        "●".bright_green(),
                        item.file.display(),
                        o.address,
                        o.refund
                    ),
                    Err(e) => println!("{} {} -> {}", "✗".bright_red(), item.file.display(), e),
                }
            }
            println!("{} deployed, {} failed", summary.deployed, summary.failed);
        }
        DeployCommand::Fees => {
            println!("{}", engine.fee_balance()?);
        }
        DeployCommand::ClearHalt => {
            require_cli_permission(instance, actor, Permission::Admin)?;
            engine.clear_halt(actor)?;
            println!("{} Integrity halt cleared", "✓".bright_green());
        }
    }
    Ok(())
}

fn run_manifest_cli(cli: &ManifestCli) -> Result<(), ForgeError> {
    match &cli.command {
        ManifestCommand::Build {
            routes,
            version,
            epoch,
            out,
        } => {
            let raw = std::fs::read_to_string(routes)?;
            let routes: Vec<Route> = serde_json::from_str(&raw)
                .map_err(|e| ForgeError::Validation(format!("routes parse: {}", e)))?;
            let manifest = Manifest::build(version, *epoch, routes)?;
            manifest.save(out)?;
            println!("Manifest written to {}", out.display());
            println!("  root: {}", manifest.merkle_root);
            println!("  hash: {}", manifest.manifest_hash());
        }
        ManifestCommand::Show { file } => {
            let manifest = Manifest::load(file)?;
            manifest.check_root()?;
            println!("version: {}", manifest.version);
            println!("epoch: {}", manifest.epoch);
            println!("routes: {}", manifest.routes.len());
            println!("root: {}", manifest.merkle_root);
            println!("hash: {}", manifest.manifest_hash());
        }
    }
    Ok(())
}

fn run_router_cli(instance: &Instance, actor: &str, cli: RouterCli) -> Result<(), ForgeError> {
    let router = instance.router();
    match cli.command {
        RouterCommand::Commit { manifest } => {
            let manifest = Manifest::load(&manifest)?;
            manifest.check_root()?;
            let manifest_hash = manifest.manifest_hash();
            let pending = router.commit(
                actor,
                manifest.merkle_root,
                manifest.epoch,
                manifest.routes.len() as u64,
                Some(manifest_hash),
            )?;
            instance.engine()?.record_manifest_hash(actor, &manifest_hash)?;
            println!(
                "{} Committed root {} (epoch {}, activatable at {}Z)",
                "●".bright_green(),
                pending.root,
                pending.epoch,
                pending.not_before
            );
        }
        RouterCommand::Apply { manifest, selector } => {
            let manifest = Manifest::load(&manifest)?;
            manifest.check_root()?;
            let pairs = match selector {
                Some(hex) => vec![manifest.prove(&Selector::from_hex(&hex)?)?],
                None => manifest.proofs()?,
            };
            let mut applied = 0usize;
            let mut skipped = 0usize;
            for (route, proof) in pairs {
                if router.apply_route(actor, route, &proof)? {
                    applied += 1;
                } else {
                    skipped += 1;
                }
            }
            println!("{} applied, {} already staged", applied, skipped);
        }
        RouterCommand::Activate => {
            let record = router.activate(actor)?;
            println!(
                "{} Activated epoch {} (root {}, activation {})",
                "●".bright_green(),
                record.epoch,
                record.manifest_root,
                record.activation_id
            );
        }
        RouterCommand::Cancel => {
            let cancelled = router.cancel(actor)?;
            println!("Cancelled pending root {}", cancelled.root);
        }
        RouterCommand::Pause => {
            if router.pause(actor)? {
                println!("{} Instance paused", "⚠".bright_yellow());
            } else {
                println!("Already paused");
            }
        }
        RouterCommand::Unpause => {
            if router.unpause(actor)? {
                println!("{} Instance unpaused", "✓".bright_green());
            } else {
                println!("Not paused");
            }
        }
        RouterCommand::Resolve { selector } => {
            let selector = Selector::from_hex(&selector)?;
            match router.resolve(&selector, &instance.engine()?)? {
                Some(address) => println!("{}", address),
                None => println!("no route"),
            }
        }
        RouterCommand::Routes => {
            let routes = router.state()?.routes();
            println!("{}", serde_json::to_string_pretty(&routes).unwrap());
        }
        RouterCommand::Implementations => {
            let implementations = router.state()?.implementations();
            println!("{}", serde_json::to_string_pretty(&implementations).unwrap());
        }
        RouterCommand::Status => {
            let status = router.state()?.status();
            println!("{}", serde_json::to_string_pretty(&status).unwrap());
        }
        RouterCommand::Activations => {
            let state = router.state()?;
            println!(
                "{}",
                serde_json::to_string_pretty(state.activations()).unwrap()
            );
        }
    }
    Ok(())
}

fn run_role_cli(instance: &Instance, actor: &str, cli: RoleCli) -> Result<(), ForgeError> {
    let router = instance.router();
    match cli.command {
        RoleCommand::Grant {
            principal,
            permission,
        } => {
            let permission = Permission::parse(&permission)?;
            if router.grant(actor, &principal, permission)? {
                println!("Granted {} to {}", permission.as_str(), principal);
            } else {
                println!("{} already holds {}", principal, permission.as_str());
            }
        }
        RoleCommand::Revoke {
            principal,
            permission,
        } => {
            let permission = Permission::parse(&permission)?;
            if router.revoke(actor, &principal, permission)? {
                println!("Revoked {} from {}", permission.as_str(), principal);
            } else {
                println!("{} did not hold {}", principal, permission.as_str());
            }
        }
        RoleCommand::List => {
            let state = router.state()?;
            for (principal, permission) in state.roles.assignments() {
                println!("{}  {}", principal, permission.as_str());
            }
        }
    }
    Ok(())
}

fn require_cli_permission(
    instance: &Instance,
    actor: &str,
    permission: Permission,
) -> Result<(), ForgeError> {
    let state = instance.router().state()?;
    if state.roles.permission(actor, permission) {
        Ok(())
    } else {
        Err(ForgeError::Authorization {
            principal: actor.to_string(),
            permission: permission.as_str().to_string(),
        })
    }
}
