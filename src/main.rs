//! snitch-rt: run offloaded jobs on a simulated Snitch machine

use std::env;

use snitch_rt::offload::{run_job_loop, AxpyArgs, AxpyJob, JobTable, AXPY_JOB_ID};
use snitch_rt::{Config, Machine};

fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let args: Vec<String> = env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }
    if args.iter().any(|a| a == "--sample-config") {
        print!("{}", Config::sample_config());
        return Ok(());
    }
    if args.iter().any(|a| a == "--show-config") {
        return show_config();
    }

    let command = args.iter().skip(1).find(|a| !a.starts_with('-'));
    match command.map(|s| s.as_str()) {
        None | Some("demo") => {
            let n = args
                .iter()
                .skip_while(|a| *a != "-n")
                .nth(1)
                .map(|s| s.parse::<u32>())
                .transpose()?
                .unwrap_or(1024);
            run_demo(n)
        }
        Some("topology") => show_topology(),
        Some(other) => {
            print_usage();
            anyhow::bail!("unknown command: {}", other)
        }
    }
}

fn print_usage() {
    println!("Usage: snitch-rt [demo [-n N] | topology] [--sample-config] [--show-config]");
    println!();
    println!("  demo             offload z = a*x + y over N doubles (default 1024)");
    println!("  topology         list every core of the configured machine");
    println!("  --sample-config  print a config file template");
    println!("  --show-config    print the effective configuration");
}

fn show_config() -> anyhow::Result<()> {
    let config = Config::get();
    config.validate()?;
    let layout = config.layout();
    println!("Effective configuration");
    println!("=======================");
    if let Some(path) = Config::user_config_path() {
        println!("User config:         {}", path.display());
    }
    println!("cores_per_cluster:     {}", config.cores_per_cluster());
    println!("clusters_per_quadrant: {}", config.clusters_per_quadrant());
    println!("quadrant_count:        {}", config.quadrant_count());
    println!("hartid_base:           {}", config.hartid_base());
    println!("tcdm_base:             {:#x}", layout.tcdm_base);
    println!("tcdm_size:             {:#x}", layout.tcdm_size);
    println!("tcdm_stride:           {:#x}", layout.tcdm_stride);
    println!("global_base:           {:#x}", layout.global_base);
    println!("global_size:           {:#x}", layout.global_size);
    println!("wait policy:           {:?}", config.wait_policy());
    Ok(())
}

fn show_topology() -> anyhow::Result<()> {
    let topology = Config::get().topology()?;
    println!(
        "{} quadrants x {} clusters x {} cores",
        topology.quadrant_count, topology.clusters_per_quadrant, topology.cores_per_cluster
    );
    for id in 0..topology.core_count() {
        println!("  {}", topology.resolve(id));
    }
    Ok(())
}

/// Offload one AXPY job and check the result on the host.
fn run_demo(n: u32) -> anyhow::Result<()> {
    let machine = Machine::from_config(Config::get())?;
    let topology = *machine.topology();
    println!(
        "Machine: {} clusters x {} cores, {} elements",
        topology.cluster_count(),
        topology.cores_per_cluster,
        n
    );

    let mut table = JobTable::new();
    table.register(AXPY_JOB_ID, AxpyJob);

    let a = 2.5;
    let x: Vec<f64> = (0..n).map(|i| i as f64).collect();
    let y: Vec<f64> = (0..n).map(|i| (n - i) as f64 * 0.5).collect();

    let (result, _) = machine.run_with_host(
        |ctx| run_job_loop(ctx, &table),
        |host| -> anyhow::Result<Vec<f64>> {
            host.wait_for_device();
            let z = (|| {
                let args = AxpyArgs {
                    n,
                    a,
                    x_ptr: host.upload(&x)?,
                    y_ptr: host.upload(&y)?,
                    z_ptr: host.upload(&vec![0.0f64; n as usize])?,
                    ..Default::default()
                };
                host.offload(AXPY_JOB_ID, &args)?;
                host.download::<f64>(args.z_ptr, n as usize)
            })();
            // Release the device even if the job could not be posted
            host.shutdown();
            Ok(z?)
        },
    );
    let z = result?;

    let mismatches = (0..n as usize)
        .filter(|&i| z[i] != a * x[i] + y[i])
        .count();
    println!();
    println!("First elements:");
    for i in 0..z.len().min(8) {
        println!("  z[{}] = {} * {} + {} = {}", i, a, x[i], y[i], z[i]);
    }
    if let Some(dma) = (0..topology.cluster_count())
        .map(|c| machine.cluster(c).dma().lifetime_stats())
        .reduce(|acc, s| snitch_rt::dma::DmaStats {
            transfers: acc.transfers + s.transfers,
            bytes: acc.bytes + s.bytes,
            busy: acc.busy + s.busy,
            elapsed: acc.elapsed.max(s.elapsed),
        })
    {
        println!();
        println!("DMA: {} transfers, {} bytes", dma.transfers, dma.bytes);
    }

    anyhow::ensure!(mismatches == 0, "{} of {} elements wrong", mismatches, n);
    println!();
    println!("All {} elements correct", n);
    Ok(())
}
