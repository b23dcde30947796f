//! Donor Segments: evaluate segment rules and reconcile membership against
//! a JSON fixture of donors, donations and segments.
//!
//! Results are printed to stdout as pretty JSON; logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use donor_core::config::AppConfig;
use donor_core::event_bus::LoggingSink;
use donor_segmentation::{DonorMetricsUpdater, Fixture, MemoryStore, SegmentService};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "donor-segments")]
#[command(about = "Segment rule evaluation and membership sync for donor data")]
#[command(version)]
struct Cli {
    /// JSON fixture holding donors, donations, segments and members
    #[arg(long, env = "DONOR_SEGMENTS_FIXTURE")]
    fixture: PathBuf,

    /// Write the store back to this path after the command succeeds
    #[arg(long)]
    save: Option<PathBuf>,

    /// Maximum donors listed by a preview (overrides config)
    #[arg(long, env = "DONOR_SEGMENTS__SEGMENTS__PREVIEW_LIMIT")]
    preview_limit: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Count and list matching donors without touching membership
    Preview {
        #[arg(long)]
        organization: Uuid,
        /// Rule document as JSON text
        #[arg(long)]
        rules: String,
    },

    /// Reconcile one segment from its stored rules
    Sync {
        #[arg(long)]
        segment: Uuid,
    },

    /// Reconcile every segment in the fixture
    SyncAll,

    /// Re-test one donor against every segment of its organization
    Refresh {
        #[arg(long)]
        donor: Uuid,
    },

    /// Recompute a donor's giving metrics, then refresh its memberships
    Recalculate {
        #[arg(long)]
        donor: Uuid,
    },

    /// List an organization's segments by name
    List {
        #[arg(long)]
        organization: Uuid,
    },

    /// Show the stored members of a segment
    Members {
        #[arg(long)]
        organization: Uuid,
        #[arg(long)]
        segment: Uuid,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "donor_segments=info,donor_segmentation=info".into()),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });
    if let Some(limit) = cli.preview_limit {
        config.segments.preview_limit = limit;
    }
    info!(
        node_id = %config.node_id,
        preview_limit = config.segments.preview_limit,
        resync_on_read = config.segments.resync_on_read,
        "Configuration loaded"
    );

    let raw = std::fs::read_to_string(&cli.fixture)
        .with_context(|| format!("failed to read fixture {}", cli.fixture.display()))?;
    let fixture: Fixture = serde_json::from_str(&raw).context("failed to parse fixture")?;
    let segment_ids: Vec<Uuid> = fixture.segments.iter().map(|s| s.id).collect();
    info!(
        donors = fixture.donors.len(),
        donations = fixture.donations.len(),
        segments = segment_ids.len(),
        "Fixture loaded"
    );

    let store = Arc::new(MemoryStore::from_fixture(fixture)?);
    let service = SegmentService::new(store.clone(), Arc::new(LoggingSink), &config.segments);
    let sync = service.synchronizer();

    match cli.command {
        Commands::Preview {
            organization,
            rules,
        } => {
            let rules: Value = serde_json::from_str(&rules).context("--rules is not valid JSON")?;
            print_json(&service.preview(organization, &rules)?)?;
        }
        Commands::Sync { segment } => print_json(&sync.sync_segment(segment)?)?,
        Commands::SyncAll => {
            let outcomes = segment_ids
                .into_iter()
                .map(|id| sync.sync_segment(id))
                .collect::<Result<Vec<_>, _>>()?;
            print_json(&outcomes)?;
        }
        Commands::Refresh { donor } => print_json(&sync.refresh_for_donor(donor)?)?,
        Commands::Recalculate { donor } => {
            let updater = DonorMetricsUpdater::new(sync.clone(), config.retention.clone());
            print_json(&updater.recalculate(donor)?)?;
        }
        Commands::List { organization } => print_json(&service.list_segments(organization)?)?,
        Commands::Members {
            organization,
            segment,
        } => print_json(&service.segment_members(organization, segment)?)?,
    }

    if let Some(path) = cli.save {
        let out = serde_json::to_string_pretty(&store.snapshot())?;
        std::fs::write(&path, out)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(path = %path.display(), "Store saved");
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
