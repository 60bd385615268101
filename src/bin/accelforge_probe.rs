use accelforge::backend::vendor::VendorFamily;
use accelforge::backend::{gpu, tpu, BackendKind};
use accelforge::bootstrap::{global_registry, Bootstrap};
use accelforge::config::{keys, EnvSource};
use accelforge::{logging, profiling};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "accelforge-probe", version)]
#[command(about = "Inspect and exercise the AccelForge bootstrap", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the dispatch decision for a device without side effects
    Plan {
        /// Device identifier (defaults to ACCELFORGE_DEVICE)
        device: Option<String>,
    },
    /// Run a real initialization and report the outcome
    Init {
        /// Device identifier (defaults to ACCELFORGE_DEVICE)
        device: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    logging::init_logging_default();
    let cli = Cli::parse();
    let env = EnvSource::process();
    match cli.command {
        Commands::Plan { device } => plan(&env, &resolve_device(&env, device)?),
        Commands::Init { device } => init(&resolve_device(&env, device)?),
    }
}

fn resolve_device(env: &EnvSource, arg: Option<String>) -> anyhow::Result<String> {
    arg.or_else(|| env.raw(keys::DEVICE))
        .ok_or_else(|| anyhow::anyhow!("no device given and {} is unset", keys::DEVICE))
}

fn plan(env: &EnvSource, device: &str) -> anyhow::Result<()> {
    let kind = BackendKind::parse(device);
    let dynamic = env.get_bool(keys::DYNAMIC_PLUGINS, false);
    println!("device:            {device}");
    println!("backend kind:      {kind}");
    println!("dynamic plugins:   {dynamic}");

    if dynamic && device != "CPU" {
        let registered = global_registry().lookup(device).is_some();
        println!("path:              dynamic plugin");
        println!("registered:        {registered}");
        if let Some(descriptor) = global_registry().lookup(device) {
            println!("library path:      {}", descriptor.library_path(env));
            println!("coordinator:       {}", descriptor.requires_coordinator());
        }
        return Ok(());
    }

    match kind {
        BackendKind::Cpu => {
            println!(
                "async client:      {}",
                env.get_bool(keys::CPU_ASYNC_CLIENT, true)
            );
            println!(
                "device count:      {}",
                env.get_usize(keys::CPU_NUM_DEVICES, 1)
            );
        }
        BackendKind::Gpu | BackendKind::Cuda => {
            let plan = gpu::plan(env);
            println!("topology:          {}", serde_json::to_string(&plan.topology)?);
            println!(
                "allocator:         {}",
                serde_json::to_string(&plan.allocator)?
            );
            println!("async execution:   {}", plan.async_execution);
            println!("allowed devices:   {:?}", plan.allowed_devices);
            println!("visible devices:   {}", plan.visible_device_count);
            println!("needs coordinator: {}", plan.needs_coordinator);
        }
        BackendKind::Tpu => {
            println!("library path:      {}", tpu::library_path(env));
        }
        BackendKind::Xpu => {
            println!(
                "library path:      {}",
                VendorFamily::Xpu.library_path(env)
            );
        }
        BackendKind::Neuron => {
            println!(
                "library path:      {}",
                VendorFamily::Neuron.library_path(env)
            );
        }
        BackendKind::TpuLegacy => println!("path:              retired, always fails"),
        BackendKind::Unknown => println!("path:              unknown identifier, fails"),
    }
    Ok(())
}

fn init(device: &str) -> anyhow::Result<()> {
    let outcome = Bootstrap::new().initialize(device)?;
    println!("platform:     {}", outcome.client.platform());
    println!("kind:         {:?}", outcome.client.kind());
    println!("devices:      {}", outcome.client.device_count());
    println!("asynchronous: {}", outcome.client.asynchronous());
    println!("coordinated:  {}", outcome.coordinator.is_some());
    if let Some(coordinator) = &outcome.coordinator {
        println!("endpoint:     {}", coordinator.endpoint());
        println!(
            "rank:         {} of {}",
            coordinator.global_rank(),
            coordinator.global_world_size()
        );
    }
    let profilers = profiling::registered_profilers();
    if !profilers.is_empty() {
        println!("profilers:    {}", profilers.join(", "));
    }
    Ok(())
}
