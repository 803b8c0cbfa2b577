extern crate clap;

use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use log::{error, info};
use rayon::ThreadPoolBuilder;

use thalweg::node::{DemProduct, PRODUCTS_BY_NAME};
use thalweg::watershed::{read_coupled_pairs, Watershed, WatershedRasters};

#[derive(Parser)]
struct Opts {
    /// Path to the model directory
    path_to_model: PathBuf,

    /// Minimum slope threshold; skip the minimum pass when omitted
    #[clap(long)]
    tslopemin: Option<f64>,

    /// Maximum slope threshold; skip the maximum pass when omitted
    #[clap(long)]
    tslopemax: Option<f64>,

    /// Directory holding the sub-pixel DEMs, defaults to the model directory
    #[clap(long)]
    subpixel_dir: Option<PathBuf>,

    /// Restrict the run to these products, e.g. dem_after_corr,dem_10m
    #[clap(long, value_delimiter = ',', value_parser = parse_product)]
    products: Vec<DemProduct>,

    /// Number of CPU threads
    #[clap(short, long, default_value = "4")]
    ncpu: usize,
}

fn parse_product(name: &str) -> Result<DemProduct, String> {
    PRODUCTS_BY_NAME
        .get(name)
        .copied()
        .ok_or_else(|| format!("unknown product {:?}", name))
}

fn run(opts: &Opts) -> thalweg::Result<()> {
    let dir = opts.path_to_model.as_path();

    let rasters = WatershedRasters::load(dir, opts.subpixel_dir.as_deref())?;
    let coupled = read_coupled_pairs(dir.join("Coupled_pairs.txt"))?;

    let mut watershed = Watershed::build(&rasters, &coupled, opts.tslopemin, opts.tslopemax)?;
    if !opts.products.is_empty() {
        watershed.products.retain(|p| opts.products.contains(p));
    }
    watershed.slope_corrections()?;
    watershed.write_corrections(dir)?;

    let maps = dir.join("Characteristic_maps");
    watershed
        .riversystem
        .write_reaches_csv(&watershed.nodes, &maps.join("reaches.csv"))?;
    watershed
        .riversystem
        .write_geojson(&watershed.nodes, &maps.join("reaches.geojson"))?;
    watershed
        .riversystem
        .write_summary_json(&watershed.nodes, &maps.join("network_summary.json"))?;

    info!("Done");
    Ok(())
}

fn main() {
    env_logger::init();

    let opts: Opts = Opts::parse();

    ThreadPoolBuilder::new()
        .num_threads(opts.ncpu)
        .build_global()
        .unwrap();

    if let Err(e) = run(&opts) {
        error!("{}", e);
        exit(1);
    }
}
