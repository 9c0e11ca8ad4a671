use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facevault_core::{
    compare_descriptors, now_millis, Descriptor, Embedding, RegistryPatch, DEFAULT_MATCH_THRESHOLD,
};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.freedesktop.FaceVault1",
    default_service = "org.freedesktop.FaceVault1",
    default_path = "/org/freedesktop/FaceVault1"
)]
trait FaceVault {
    fn save_embedding(&self, embedding_json: &str) -> zbus::Result<()>;
    fn get_embedding(&self, identity_id: &str) -> zbus::Result<String>;
    fn delete_user_record(&self, identity_id: &str) -> zbus::Result<()>;
    fn update_registry(&self, patch_json: &str) -> zbus::Result<String>;
    fn list_registered_users(&self) -> zbus::Result<String>;
    fn get_offline_session(&self) -> zbus::Result<String>;
    fn clear_offline_session(&self) -> zbus::Result<()>;
    fn authenticate(&self, identity_id: &str, live: Vec<f64>) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facevault", about = "FaceVault biometric identity store CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered users, newest first
    List,
    /// Show the stored embedding for an identity
    Show { identity: String },
    /// Store a face descriptor for an identity
    Enroll {
        identity: String,
        /// JSON file holding a 128-element descriptor array
        #[arg(short, long)]
        descriptor: PathBuf,
    },
    /// Authenticate an identity against a live descriptor
    Verify {
        identity: String,
        /// JSON file holding the live descriptor; `[]` means no face detected
        #[arg(short, long)]
        descriptor: PathBuf,
    },
    /// Update registry fields (an empty value clears the field)
    Update {
        identity: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        photo: Option<String>,
        #[arg(long)]
        enrolled: Option<bool>,
    },
    /// Delete an identity's embedding and registry record
    Delete { identity: String },
    /// Inspect or clear the offline session
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Show daemon status
    Status,
    /// Compare two descriptor files locally
    Compare {
        a: PathBuf,
        b: PathBuf,
        #[arg(short, long, default_value_t = DEFAULT_MATCH_THRESHOLD)]
        threshold: f32,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    Show,
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let system = cli.system;
    let proxy = || connect(system);

    match cli.command {
        Commands::Compare { a, b, threshold } => {
            let result = compare_descriptors(&read_descriptor(&a)?, &read_descriptor(&b)?, threshold);
            println!(
                "distance {:.4} (threshold {threshold}): {}",
                result.distance,
                if result.is_match { "match" } else { "no match" }
            );
        }
        Commands::List => print_json(&proxy().await?.list_registered_users().await?)?,
        Commands::Show { identity } => print_json(&proxy().await?.get_embedding(&identity).await?)?,
        Commands::Enroll {
            identity,
            descriptor,
        } => {
            let embedding = Embedding {
                identity_id: identity.clone(),
                descriptor: read_descriptor(&descriptor)?,
                updated_at: now_millis(),
            };
            proxy()
                .await?
                .save_embedding(&serde_json::to_string(&embedding)?)
                .await?;
            println!("Enrolled {identity}");
        }
        Commands::Verify {
            identity,
            descriptor,
        } => {
            let live = read_values(&descriptor)?;
            print_json(&proxy().await?.authenticate(&identity, live).await?)?;
        }
        Commands::Update {
            identity,
            email,
            name,
            photo,
            enrolled,
        } => {
            let mut patch = RegistryPatch::new(identity);
            if let Some(email) = email {
                patch = patch.email(non_empty(email));
            }
            if let Some(name) = name {
                patch = patch.display_name(non_empty(name));
            }
            if let Some(photo) = photo {
                patch = patch.photo_url(non_empty(photo));
            }
            if let Some(enrolled) = enrolled {
                patch = patch.enrolled(enrolled);
            }
            print_json(&proxy().await?.update_registry(&serde_json::to_string(&patch)?).await?)?;
        }
        Commands::Delete { identity } => {
            proxy().await?.delete_user_record(&identity).await?;
            println!("Deleted {identity}");
        }
        Commands::Session { action } => match action {
            SessionAction::Show => print_json(&proxy().await?.get_offline_session().await?)?,
            SessionAction::Clear => {
                proxy().await?.clear_offline_session().await?;
                println!("Offline session cleared");
            }
        },
        Commands::Status => print_json(&proxy().await?.status().await?)?,
    }

    Ok(())
}

async fn connect(system: bool) -> Result<FaceVaultProxy<'static>> {
    let conn = if system {
        zbus::Connection::system().await?
    } else {
        zbus::Connection::session().await?
    };
    FaceVaultProxy::new(&conn)
        .await
        .context("facevaultd is not reachable on the bus")
}

/// Raw descriptor values from a JSON array file. May be empty.
fn read_values(path: &Path) -> Result<Vec<f64>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_values(&text).with_context(|| format!("invalid descriptor file {}", path.display()))
}

fn parse_values(text: &str) -> Result<Vec<f64>> {
    Ok(serde_json::from_str(text)?)
}

fn read_descriptor(path: &Path) -> Result<Descriptor> {
    let values = read_values(path)?;
    if values.is_empty() {
        bail!("{} holds no descriptor", path.display());
    }
    Descriptor::from_f64(&values).with_context(|| format!("invalid descriptor in {}", path.display()))
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

fn print_json(reply: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(reply)?;
    if value.is_null() {
        println!("(none)");
    } else {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}
