//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - loads `.env` and installs the logger
//! - parses CLI arguments
//! - loads or generates regions
//! - runs fits / simulations
//! - prints reports and writes optional exports

use clap::Parser;
use log::{info, warn};

use crate::cli::{Command, DemoArgs, FitArgs, SimulateArgs};
use crate::data::{SyntheticSpec, synthetic_record_with};
use crate::domain::RegionDataset;
use crate::error::AppError;
use crate::io::{load_regions, write_fit_records, write_region_records, write_simulation_csv, write_simulation_json};
use crate::models::{CompartmentalModel, IntegrationLock, ParamSet};
use crate::report::format_simulation_summary;

pub mod pipeline;

/// Entry point for the `epi` binary.
pub fn run() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = crate::cli::Cli::parse();
    match cli.command {
        Command::Fit(args) => handle_fit(args),
        Command::Simulate(args) => handle_simulate(args),
        Command::Demo(args) => handle_demo(args),
    }
}

fn handle_fit(args: FitArgs) -> Result<(), AppError> {
    let regions = load_regions(&args.input)?;
    if regions.is_empty() {
        return Err(AppError::invalid(format!("no regions in '{}'", args.input.display())));
    }
    info!("fitting {} regions from {}", regions.len(), args.input.display());
    report_fits(&regions, &args.tuning)
}

fn handle_demo(args: DemoArgs) -> Result<(), AppError> {
    let spec = SyntheticSpec {
        noise_sigma: args.noise,
        ..SyntheticSpec::default()
    };
    let records = (0..args.regions)
        .map(|k| synthetic_record_with(&format!("synthetic-{}", k + 1), args.days, args.seed + k as u64, &spec))
        .collect::<Result<Vec<_>, _>>()?;
    if let Some(path) = &args.write_sample {
        write_region_records(path, &records)?;
    }
    let regions = records
        .into_iter()
        .map(RegionDataset::from_record)
        .collect::<Result<Vec<_>, _>>()?;
    report_fits(&regions, &args.tuning)
}

/// Print every summary, export the records, then surface the first failure.
fn report_fits(regions: &[RegionDataset], tuning: &crate::cli::FitTuning) -> Result<(), AppError> {
    let run = pipeline::run_fits(regions, tuning)?;
    for summary in &run.summaries {
        println!("{summary}");
    }
    if let Some(path) = &tuning.export {
        write_fit_records(path, &run.records)?;
    }
    match run.failures.into_iter().next() {
        Some((name, err)) => {
            warn!("{name}: first failed fit of {} regions", regions.len());
            Err(err)
        }
        None => Ok(()),
    }
}

fn handle_simulate(args: SimulateArgs) -> Result<(), AppError> {
    let regions = load_regions(&args.input)?;
    let region = match &args.region {
        Some(name) => regions
            .iter()
            .find(|r| r.name() == name)
            .ok_or_else(|| AppError::invalid(format!("no region named '{name}' in '{}'", args.input.display())))?,
        None => regions
            .first()
            .ok_or_else(|| AppError::invalid(format!("no regions in '{}'", args.input.display())))?,
    };

    let shift = args.shift.unwrap_or_else(|| region.stored_outbreak_shift());
    let days = match args.days {
        Some(days) => days,
        None => region.data_days(shift).max(1) as usize,
    };
    let model = CompartmentalModel::new(args.model, region, IntegrationLock::new());
    let params = ParamSet::initial(args.model, region)?;
    let sim = model.simulate(&params, days, shift, args.sanity)?;

    println!("{}", format_simulation_summary(&sim, region.name()));

    if args.export_csv.is_some() || args.export_json.is_some() {
        let record = sim.to_record(region.name());
        if let Some(path) = &args.export_csv {
            write_simulation_csv(path, &record)?;
        }
        if let Some(path) = &args.export_json {
            write_simulation_json(path, &record)?;
        }
    }
    Ok(())
}
