use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use vidpipe_rs::integration::{EventFilter, read_events};
use vidpipe_rs::{JobOrchestrator, JobParams, JobStatus, Settings, Zone};

/// Run one mock analytics job and print its summary.
#[derive(Debug, Parser)]
#[command(name = "vidpipe-demo", version)]
struct Args {
    /// Settings file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 240)]
    max_frames: u32,

    #[arg(long, default_value_t = 30)]
    fps: u32,

    #[arg(long, default_value_t = 3.0)]
    dwell_seconds: f64,

    /// Zone as `name:x1,y1,x2,y2`; repeatable
    #[arg(long = "zone", value_parser = parse_zone)]
    zones: Vec<Zone>,

    #[arg(long)]
    proximity_distance: Option<f64>,

    #[arg(long, default_value = "demo")]
    caller: String,
}

fn parse_zone(raw: &str) -> Result<Zone, String> {
    let (name, coords) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected name:x1,y1,x2,y2, got '{raw}'"))?;
    let values: Vec<f64> = coords
        .split(',')
        .map(|v| v.trim().parse::<f64>().map_err(|e| format!("bad coordinate '{v}': {e}")))
        .collect::<Result<_, _>>()?;
    let &[x1, y1, x2, y2] = values.as_slice() else {
        return Err(format!("expected 4 coordinates, got {}", values.len()));
    };
    Ok(Zone::rect(name, x1, y1, x2, y2))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref()).context("loading settings")?;
    let orchestrator = JobOrchestrator::with_defaults(&settings);

    let params = JobParams {
        max_frames: args.max_frames,
        fps: args.fps,
        dwell_seconds: args.dwell_seconds,
        zones: args.zones,
        proximity_distance: args.proximity_distance,
        ..Default::default()
    };

    let submission = orchestrator.submit(params, &args.caller, None).await?;
    let job = orchestrator.wait(submission.job.id).await?;

    if job.status != JobStatus::Completed {
        bail!(
            "job {} ended as {}: {}",
            job.id,
            job.status,
            job.error.as_deref().unwrap_or("no error recorded")
        );
    }

    if let Some(summary) = &job.summary {
        println!("job {}", job.id);
        println!("  frames processed : {}", summary.frames_processed);
        println!("  events detected  : {}", summary.events_detected);
        println!("  processing fps   : {:.1}", summary.average_processing_fps);
    }
    if let Some(path) = &job.artifacts.analytics_path {
        println!("  analytics        : {}", path.display());
        for event in read_events(path, &EventFilter { limit: Some(10), ..Default::default() })? {
            println!(
                "  [{:>5}] {:<10} object {} {:?}",
                event.frame,
                event.kind.to_string(),
                event.object_id,
                event.severity
            );
        }
    }
    Ok(())
}
