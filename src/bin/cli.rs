use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use sqlx::PgPool;
use uuid::Uuid;

use anon_session::authz::groups;
use anon_session::config::MaskingPolicy;
use anon_session::db::{self, SessionConnection};
use anon_session::jwt::JwtConfig;
use anon_session::masking::{ExtensionStatus, RoleRegistry, RoleSwitcher, ScopeBuilder};
use anon_session::sql;

#[derive(Parser, Debug)]
#[command(author, version, about = "anon-session role and label tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a masked role (no-op when it already exists)
    CreateRole {
        name: String,
        /// Role the new role is created as a member of
        #[arg(long)]
        inherit_from: Option<String>,
    },
    /// Show the masking policy, extension state and the roles labelled MASKED
    Status,
    /// Re-apply read grants and the MASKED label to existing masked roles
    FixPermissions {
        #[arg(long, conflicts_with = "all", required_unless_present = "all")]
        role: Option<String>,
        /// Every role labelled MASKED in the database
        #[arg(long)]
        all: bool,
    },
    /// Enter a scope under the role, print current_user, and leave it
    CheckRole {
        name: String,
        #[arg(long)]
        auto_create: bool,
    },
    /// Print the SECURITY LABEL statement masking a column
    LabelSql { table: String, column: String, function: String },
    /// Print the statement removing a column's masking label
    DropLabelSql { table: String, column: String },
    /// Issue a bearer token for trying the masking gate
    IssueToken {
        #[arg(long)]
        sub: Option<Uuid>,
        #[arg(long)]
        username: Option<String>,
        /// Comma-separated group list
        #[arg(long, value_delimiter = ',', default_value = groups::VIEW_MASKED_DATA)]
        groups: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if dotenv().is_err() {
        let crate_env = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(crate_env);
    }
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::CreateRole { name, inherit_from } => {
            let pool = db::init().await?;
            let mut conn = pool.acquire().await.context("acquiring connection")?;
            let created = RoleSwitcher::new()
                .create_role(&mut conn, &name, inherit_from.as_deref())
                .await;
            if !created {
                anyhow::bail!("could not create masked role {name}; see log for details");
            }
            println!("Masked role ready: {name}");
        }
        Commands::Status => {
            let pool = db::init().await?;
            print_status(&pool).await?;
        }
        Commands::FixPermissions { role, all } => {
            let pool = db::init().await?;
            fix_permissions(&pool, role, all).await?;
        }
        Commands::CheckRole { name, auto_create } => {
            let pool = db::init().await?;
            let current_user = ScopeBuilder::role(&name)
                .auto_create(auto_create)
                .run(&pool, |session| async move {
                    let mut conn = session.connection.lock().await;
                    let current_user = conn.query_one("SELECT current_user::text").await;
                    current_user
                })
                .await??;
            println!("current_user inside scope: {}", current_user.as_deref().unwrap_or("<none>"));
        }
        Commands::LabelSql { table, column, function } => {
            println!("{}", sql::security_label_sql(&table, &column, &function)?);
        }
        Commands::DropLabelSql { table, column } => {
            println!("{}", sql::remove_label_sql(&table, &column)?);
        }
        Commands::IssueToken { sub, username, groups } => {
            let jwt = JwtConfig::from_env()?;
            let token = jwt.encode(sub.unwrap_or_else(Uuid::new_v4), username.as_deref(), groups)?;
            println!("{token}");
        }
    }

    Ok(())
}

async fn print_status(pool: &PgPool) -> anyhow::Result<()> {
    let policy = MaskingPolicy::from_env()?;
    println!("Masking enabled:     {}", policy.enabled);
    println!("Masked role:         {}", policy.default_masked_role);
    println!("Masked groups:       {}", policy.masked_groups.iter().cloned().collect::<Vec<_>>().join(", "));
    println!("Fail closed:         {}", policy.fail_closed_on_switch_error);
    println!("Mask search_path:    {}", policy.mask_search_path.as_deref().unwrap_or("<unchanged>"));

    let mut conn = pool.acquire().await.context("acquiring connection")?;
    let extension = ExtensionStatus::load(&mut conn).await.context("reading anon extension state")?;
    drop(conn);
    match &extension.installed_version {
        Some(version) => println!("anon extension:      installed ({version})"),
        None => println!("anon extension:      not installed"),
    }
    if let Some(version) = &extension.runtime_version {
        println!("anon.version():      {version}");
    }
    println!("anon labels:         {}", extension.label_count);

    let registry = RoleRegistry::new();
    registry.hydrate(pool).await.context("reading pg_seclabels")?;

    let roles = registry.list();
    if roles.is_empty() {
        println!("No roles labelled MASKED");
        return Ok(());
    }

    println!("Roles labelled MASKED:");
    for role in roles {
        println!("  {role}");
    }
    Ok(())
}

async fn fix_permissions(pool: &PgPool, role: Option<String>, all: bool) -> anyhow::Result<()> {
    let roles: Vec<String> = if all {
        let registry = RoleRegistry::new();
        registry.hydrate(pool).await.context("reading pg_seclabels")?;
        registry.list().into_iter().map(|role| role.name).collect()
    } else {
        role.into_iter().collect()
    };

    if roles.is_empty() {
        println!("No roles labelled MASKED");
        return Ok(());
    }

    let switcher = RoleSwitcher::new();
    let mut conn = pool.acquire().await.context("acquiring connection")?;
    let mut failed = Vec::new();
    for name in roles {
        if switcher.ensure_permissions(&mut conn, &name).await {
            println!("Permissions fixed: {name}");
        } else {
            failed.push(name);
        }
    }

    if !failed.is_empty() {
        anyhow::bail!("could not fix permissions for {}; see log for details", failed.join(", "));
    }
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}
