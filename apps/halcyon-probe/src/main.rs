//! Halcyon device probe
//!
//! Builds a context, prints what negotiation settled on, runs one upload
//! and submission through every queue and reports the allocation counters.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p halcyon-probe -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--simulated`: Use the in-process simulated device instead of Vulkan
//! - `-c, --config <PATH>`: Load a `ContextConfig` from a TOML file
//! - `--validation`: Force the validation layer on
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)
//! - `HALCYON_VALIDATION`: `0` or `1`, overrides the validation setting

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use ash::vk;
use gpu_allocator::MemoryLocation;
use halcyon_gpu::driver::simulated::{SimulatedAdapter, SimulatedBackend};
use halcyon_gpu::{
    allocation_stats, upload_image, BufferDesc, Context, ContextBuilder, ContextConfig, ImageData,
    SubmitInfo,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Default)]
struct Args {
    simulated: bool,
    config: Option<PathBuf>,
    validation: bool,
}

fn main() -> anyhow::Result<()> {
    let Some(args) = parse_args()? else {
        print_help();
        return Ok(());
    };
    init_logging();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => ContextConfig {
            app_name: "halcyon-probe".to_string(),
            ..Default::default()
        },
    };
    if args.validation {
        config.validation = true;
    }

    let builder = ContextBuilder::from_config(config);
    let context = if args.simulated {
        let backend = SimulatedBackend::new([SimulatedAdapter::discrete("Simulated GPU")]);
        builder.build_with(&backend)?
    } else {
        builder.build().context("no usable Vulkan device; try --simulated")?
    };

    print_device(&context);
    exercise(&context)?;
    print_stats(&context);
    Ok(())
}

fn init_logging() {
    #[cfg(feature = "profiling-tracy")]
    {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,halcyon_gpu=trace,halcyon_probe=trace"));
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }
    #[cfg(not(feature = "profiling-tracy"))]
    {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init();
    }
}

fn load_config(path: &Path) -> anyhow::Result<ContextConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config = toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

fn print_device(context: &Context) {
    let adapter = context.adapter();
    println!("Device:       {}", adapter.summary());
    println!("Capabilities: {}", context.caps());
    println!("Heap mode:    {:?}", context.heap().mode());
    println!("Pipelines:    {:?}", context.pipelines().mode());
    println!("Queues:");
    for queue in context.queues() {
        println!(
            "  {:<14} family {} index {}",
            queue.kind().name(),
            queue.family(),
            queue.index()
        );
    }
}

/// Push a little work through the runtime so the counters have something to show.
fn exercise(context: &Context) -> anyhow::Result<()> {
    let texels = vec![0x80u8; 64 * 64 * 4];
    let uploaded = upload_image(
        context,
        "probe texture",
        &ImageData {
            bytes: &texels,
            format: vk::Format::R8G8B8A8_UNORM,
            extent: vk::Extent2D {
                width: 64,
                height: 64,
            },
        },
        true,
    )?;
    if let Some(ready) = &uploaded.ready {
        ready.wait()?;
    }

    let buffer = context.create_buffer(&BufferDesc {
        name: "probe buffer",
        size: 64 * 1024,
        usage: vk::BufferUsageFlags::STORAGE_BUFFER,
        location: MemoryLocation::GpuOnly,
    })?;

    for queue in context.queues() {
        let list = queue.begin()?;
        queue.submit(vec![list], SubmitInfo::default())?.wait()?;
    }

    drop(buffer);
    drop(uploaded);
    context.wait_idle()?;
    let destroyed = context.collect_garbage()?;
    info!("Probe work finished; {destroyed} objects reclaimed");
    Ok(())
}

fn print_stats(context: &Context) {
    let stats = context.stats();
    let process = allocation_stats();
    println!(
        "Heap:         {}/{} images, {}/{} samplers",
        stats.heap.images_live,
        stats.heap.image_capacity,
        stats.heap.samplers_live,
        stats.heap.sampler_capacity
    );
    println!(
        "Pipelines:    {} entries ({} fragments)",
        stats.pipelines.total_entries(),
        stats.pipelines.fragment_entries()
    );
    println!("Shaders:      {}", stats.shaders);
    println!(
        "Allocations:  {} total, {} live buffers, {} live images, {} bytes live, {:.1}/s",
        process.total_allocations,
        process.live_buffers,
        process.live_images,
        process.live_bytes,
        process.allocations_per_second
    );
}

/// `None` when help was requested.
fn parse_args() -> anyhow::Result<Option<Args>> {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--simulated" => args.simulated = true,
            "--validation" => args.validation = true,
            "-c" | "--config" => {
                let path = iter.next().context("--config needs a path")?;
                args.config = Some(PathBuf::from(path));
            }
            "-h" | "--help" => return Ok(None),
            other => anyhow::bail!("unknown argument {other:?}; see --help"),
        }
    }
    Ok(Some(args))
}

fn print_help() {
    eprintln!(
        "Halcyon device probe

USAGE:
    cargo run -p halcyon-probe -- [OPTIONS]

OPTIONS:
    --simulated          Use the simulated device instead of Vulkan
    -c, --config <PATH>  Load context settings from a TOML file
    --validation         Enable the Khronos validation layer
    -h, --help           Print this message

CONFIG FILE:
    app_name = \"probe\"
    validation = false
    require_presentation = false
    pool_capacity = 16
    queues_per_role = 2

    [heap]
    image_capacity = 65536
    sampler_capacity = 4096"
    );
}
