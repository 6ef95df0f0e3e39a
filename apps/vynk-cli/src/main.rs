use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value as JsonValue};
use std::path::PathBuf;
use std::time::Duration;

use vynk_kernel::Kernel;
use vynk_protocol::{GuildConfig, Snowflake, VerificationMethod};

#[derive(Parser)]
#[command(name = "vynk-cli", version, about = "Vynk verification bridge utilities")]
struct Cli {
    /// State directory holding vynk.sqlite
    #[arg(long, global = true, env = "VYNK_STATE_DIR", default_value = "state")]
    state_dir: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a guild's verification settings
    Setup(SetupArgs),
    /// Print verification counters for a guild (JSON)
    Stats(GuildArgs),
    /// Print the most recent verification log entries (JSON)
    Recent(RecentArgs),
    /// Query a running server's gateway status
    Status(RemoteArgs),
    /// Ask a running server to grant the verified role
    Assign(AssignArgs),
}

#[derive(Args)]
struct SetupArgs {
    #[arg(long)]
    guild: Snowflake,
    /// Channel where the verification prompt lives
    #[arg(long)]
    channel: Snowflake,
    /// Role granted on successful verification
    #[arg(long)]
    role: Snowflake,
    /// Channel receiving success/failure notifications
    #[arg(long)]
    log_channel: Option<Snowflake>,
    #[arg(long, default_value = "button")]
    method: VerificationMethod,
}

#[derive(Args)]
struct GuildArgs {
    #[arg(long)]
    guild: Snowflake,
}

#[derive(Args)]
struct RecentArgs {
    #[arg(long)]
    guild: Snowflake,
    #[arg(long, default_value_t = 10)]
    limit: i64,
}

#[derive(Args, Clone)]
struct RemoteArgs {
    /// Base URL of the service
    #[arg(long, default_value = "http://127.0.0.1:5000")]
    base: String,
    /// Timeout seconds
    #[arg(long, default_value_t = 20)]
    timeout: u64,
}

#[derive(Args)]
struct AssignArgs {
    #[arg(long)]
    guild: Snowflake,
    #[arg(long)]
    user: Snowflake,
    #[command(flatten)]
    remote: RemoteArgs,
}

fn main() {
    vynk_otel::init();
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Setup(args) => cmd_setup(&cli.state_dir, &args),
        Commands::Stats(args) => cmd_stats(&cli.state_dir, &args),
        Commands::Recent(args) => cmd_recent(&cli.state_dir, &args),
        Commands::Status(args) => cmd_status(&args),
        Commands::Assign(args) => cmd_assign(&args),
    }
}

fn open_kernel(state_dir: &std::path::Path) -> Result<Kernel> {
    tracing::debug!(dir = %state_dir.display(), "opening state");
    Kernel::open(state_dir).with_context(|| format!("open state dir {}", state_dir.display()))
}

fn print_json(v: &JsonValue) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

fn cmd_setup(state_dir: &std::path::Path, args: &SetupArgs) -> Result<()> {
    let kernel = open_kernel(state_dir)?;
    let cfg = GuildConfig {
        guild_id: args.guild,
        verification_channel_id: args.channel,
        verified_role_id: args.role,
        log_channel_id: args.log_channel,
        method: args.method,
    };
    kernel.put_guild_config(&cfg)?;
    println!(
        "Configured guild {} (role {}, method {})",
        cfg.guild_id,
        cfg.verified_role_id,
        cfg.method.as_str()
    );
    Ok(())
}

fn cmd_stats(state_dir: &std::path::Path, args: &GuildArgs) -> Result<()> {
    let kernel = open_kernel(state_dir)?;
    let stats = kernel.get_session_stats(args.guild)?;
    print_json(&json!({
        "guild_id": args.guild,
        "total": stats.total,
        "success_count": stats.success,
        "failed": stats.failed,
        "recent_24h": stats.recent_24h,
        "success_rate": stats.success_rate(),
    }))
}

fn cmd_recent(state_dir: &std::path::Path, args: &RecentArgs) -> Result<()> {
    if args.limit < 1 {
        bail!("--limit must be at least 1");
    }
    let kernel = open_kernel(state_dir)?;
    let entries = kernel.recent_verifications(args.guild, args.limit.min(100))?;
    print_json(&serde_json::to_value(entries)?)
}

fn client(args: &RemoteArgs) -> Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(args.timeout))
        .user_agent(concat!("vynk-cli/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

fn read_envelope(resp: reqwest::blocking::Response) -> Result<JsonValue> {
    let status = resp.status();
    let body: JsonValue = resp
        .json()
        .with_context(|| format!("decode response (status {status})"))?;
    Ok(json!({ "status": status.as_u16(), "body": body }))
}

fn cmd_status(args: &RemoteArgs) -> Result<()> {
    let base = args.base.trim_end_matches('/');
    let resp = client(args)?
        .get(format!("{base}/api/bot-status"))
        .send()
        .with_context(|| format!("GET {base}/api/bot-status"))?;
    print_json(&read_envelope(resp)?)
}

fn cmd_assign(args: &AssignArgs) -> Result<()> {
    let base = args.remote.base.trim_end_matches('/');
    let resp = client(&args.remote)?
        .post(format!("{base}/api/assign-role"))
        .json(&json!({
            "guild_id": args.guild.to_string(),
            "user_id": args.user.to_string(),
        }))
        .send()
        .with_context(|| format!("POST {base}/api/assign-role"))?;
    let out = read_envelope(resp)?;
    let success = out["body"]["success"].as_bool().unwrap_or(false);
    print_json(&out)?;
    if !success {
        bail!(
            "{}",
            out["body"]["error"].as_str().unwrap_or("role assignment failed")
        );
    }
    Ok(())
}
