use clap::Parser;
use num_complex::Complex64;
use resofit::{
    CalibrationRecord, FitConfig, FitError, FitResult, Port, PortKind, PowerUnit, ResofitError,
};
use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

pub type BinResult<T, E = Box<dyn std::error::Error + Send + Sync>> = Result<T, E>;

fn main() {
    if let Err(e) = bin_main() {
        eprintln!("error: {e}");
        if let Some(e) = e.source() {
            eprintln!("error: {e}");
        }
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Text file with columns `f re im`, lines starting with '#' are skipped
    #[arg()]
    infile: PathBuf,

    /// Port type: notch, reflection (direct), transmission (transm) or tail
    #[arg(short, long, default_value = "notch")]
    port: PortKind,

    /// JSON file with fit settings
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use this cable delay in seconds instead of fitting one
    #[arg(long)]
    delay: Option<f64>,

    /// Refine the algebraic circle fit iteratively
    #[arg(long)]
    refine: bool,

    /// Skip error propagation
    #[arg(long)]
    no_errors: bool,

    /// Unit of `--power` and of the reported single-photon limit: dbm or watt
    #[arg(long, default_value = "dbm")]
    unit: PowerUnit,

    /// Drive power at the resonator, reports the average photon number at this power
    #[arg(long, allow_hyphen_values = true)]
    power: Option<f64>,
}

#[derive(Serialize)]
struct PhotonEstimate {
    unit: String,
    single_photon_limit: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    photons_at_power: Option<f64>,
}

#[derive(Serialize)]
struct Output<'a> {
    port: PortKind,
    calibration: &'a CalibrationRecord,
    result: &'a FitResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    photons: Option<PhotonEstimate>,
}

/// Reads whitespace-separated `f re im` columns.
fn read_trace(path: &Path) -> Result<(Vec<f64>, Vec<Complex64>), ResofitError> {
    let reader = BufReader::new(File::open(path)?);
    let mut f_data = vec![];
    let mut z_data = vec![];
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let columns = line
            .split_whitespace()
            .map(str::parse::<f64>)
            .collect::<Result<Vec<f64>, _>>()
            .map_err(|e| ResofitError::Parse {
                line: i + 1,
                msg: e.to_string(),
            })?;
        match columns[..] {
            [f, re, im] => {
                f_data.push(f);
                z_data.push(Complex64::new(re, im));
            }
            _ => Err(ResofitError::Parse {
                line: i + 1,
                msg: format!("expected 3 columns, found {}", columns.len()),
            })?,
        }
    }
    Ok((f_data, z_data))
}

fn bin_main() -> BinResult<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => FitConfig::from_json_file(path)?,
        None => FitConfig::default(),
    };
    if args.delay.is_some() {
        config.fixed_delay = args.delay;
    }
    config.refine_circle |= args.refine;
    config.calc_errors &= !args.no_errors;

    let (f_data, z_data) = read_trace(&args.infile)?;
    let mut port = Port::with_data(args.port, f_data, z_data)?.with_config(config);
    port.autofit()?;

    let photons = match port.get_single_photon_limit(args.unit) {
        Ok(limit) => Some(PhotonEstimate {
            unit: args.unit.to_string(),
            single_photon_limit: limit,
            photons_at_power: args
                .power
                .map(|power| port.get_photons_in_resonator(power, args.unit))
                .transpose()?,
        }),
        // transmission fits have no coupling split
        Err(FitError::UnsupportedPortType(_)) => None,
        Err(e) => Err(e)?,
    };
    let output = Output {
        port: port.kind(),
        calibration: port.calibration()?,
        result: port.fit_result()?,
        photons,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
