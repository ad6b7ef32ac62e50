use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{Device, Tensor};
use clap::Parser;
use graft_core::{
    compile_pipe, load_lora_into_unet, load_pipe, read_state_dict, save_pipe, Conv2dWeights,
    DeltaFuser, EagerBackend, FuseOptions, GraphBackend, LayerStack, LinearWeights, Pipeline,
    Slot, SlotPipeline,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// Latent geometry of the toy pipeline: prompts are embedding vectors, the
// unet works on a 4-channel latent at 1/8 of the image resolution.
const EMBED_DIM: usize = 64;
const LATENT_CHANNELS: usize = 4;
const UNET_HIDDEN: usize = 8;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Graft pipeline compilation benchmark")]
struct Args {
    /// Number of timed denoising iterations
    #[arg(long, default_value_t = 25)]
    steps: usize,

    /// Untimed warmup iterations that materialize the graphs
    #[arg(long, default_value_t = 1)]
    warmups: usize,

    /// Image height in pixels
    #[arg(long, default_value_t = 512)]
    height: usize,

    /// Image width in pixels
    #[arg(long, default_value_t = 512)]
    width: usize,

    /// Batch size
    #[arg(long, default_value_t = 1)]
    batch: usize,

    /// Directory holding cached compiled graphs; loaded before the run and
    /// saved after it
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Pipeline part to leave uncompiled, may be repeated
    #[arg(long)]
    ignore: Vec<String>,

    /// LoRA safetensors file fused into the unet before compilation
    #[arg(long)]
    lora: Option<PathBuf>,

    /// Multiplier applied to the LoRA weights
    #[arg(long, default_value_t = 1.0)]
    lora_scale: f64,

    /// Seed for the random inputs
    #[arg(long)]
    seed: Option<u64>,

    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,
}

fn select_device(cpu: bool) -> Result<Device> {
    if cpu {
        return Ok(Device::Cpu);
    }
    if cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        info!("running on cpu, build with --features cuda or metal for gpu support");
        Ok(Device::Cpu)
    }
}

fn conv(out_c: usize, in_c: usize, device: &Device) -> Result<Conv2dWeights> {
    let weight = (Tensor::randn(0f32, 1f32, (out_c, in_c, 3, 3), device)? * 0.05)?;
    Ok(Conv2dWeights::new(weight, None, 1, 1))
}

fn linear(out_f: usize, in_f: usize, device: &Device) -> Result<LinearWeights> {
    let weight = (Tensor::randn(0f32, 1f32, (out_f, in_f), device)? * 0.05)?;
    Ok(LinearWeights::new(weight, None))
}

fn text_encoder(device: &Device) -> Result<LayerStack> {
    let mut stack = LayerStack::new();
    stack.push("embeddings.proj", linear(EMBED_DIM, EMBED_DIM, device)?);
    stack.push("encoder.final.proj", linear(EMBED_DIM, EMBED_DIM, device)?);
    Ok(stack)
}

fn unet(device: &Device) -> Result<LayerStack> {
    let mut stack = LayerStack::new();
    stack.push("conv_in", conv(UNET_HIDDEN, LATENT_CHANNELS, device)?);
    stack.push(
        "down_blocks.0.resnets.0.conv1",
        conv(UNET_HIDDEN, UNET_HIDDEN, device)?,
    );
    stack.push("conv_out", conv(LATENT_CHANNELS, UNET_HIDDEN, device)?);
    Ok(stack)
}

fn vae_decoder(device: &Device) -> Result<LayerStack> {
    let mut stack = LayerStack::new();
    stack.push("conv_in", conv(LATENT_CHANNELS, LATENT_CHANNELS, device)?);
    stack.push("conv_out", conv(3, LATENT_CHANNELS, device)?);
    Ok(stack)
}

fn build_pipeline(device: &Device) -> Result<SlotPipeline> {
    let mut pipe = SlotPipeline::new().with_image_processor();
    pipe.install(Slot::TextEncoder, Box::new(text_encoder(device)?))?;
    pipe.install(Slot::UNet, Box::new(unet(device)?))?;
    pipe.install(Slot::VaeDecoder, Box::new(vae_decoder(device)?))?;
    Ok(pipe)
}

fn forward_slot(pipe: &mut SlotPipeline, slot: Slot, inputs: &[Tensor]) -> Result<Tensor> {
    let module = pipe
        .get_mut(slot)
        .with_context(|| format!("pipeline has no {slot}"))?;
    Ok(module.forward(inputs)?)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let device = select_device(args.cpu)?;
    if let Some(seed) = args.seed {
        if let Err(err) = device.set_seed(seed) {
            warn!(%err, "seeding is not supported on this device");
        }
    }

    let mut pipe = build_pipeline(&device)?;

    if let Some(path) = &args.lora {
        info!(file = %path.display(), "fusing LoRA weights");
        let (state_dict, network_alphas) = read_state_dict(path, &device)?;
        let mut unet = pipe.take(Slot::UNet).context("pipeline has no unet")?;
        load_lora_into_unet(
            state_dict,
            Some(network_alphas),
            &mut unet,
            None,
            &DeltaFuser,
            &FuseOptions {
                lora_scale: args.lora_scale,
                ..FuseOptions::default()
            },
            Some(&mut pipe),
        )?;
        pipe.set(Slot::UNet, unet)?;
    }

    let backend: Arc<dyn GraphBackend> = Arc::new(EagerBackend::new());
    let ignores: Vec<&str> = args.ignore.iter().map(String::as_str).collect();
    compile_pipe(&mut pipe, &backend, &ignores)?;
    if let Some(dir) = &args.cache_dir {
        load_pipe(&mut pipe, dir, &ignores)?;
    }

    let (latent_h, latent_w) = (args.height / 8, args.width / 8);
    let prompt = Tensor::randn(0f32, 1f32, (args.batch, EMBED_DIM), &device)?;
    let cond = forward_slot(&mut pipe, Slot::TextEncoder, &[prompt])?;
    let latent = Tensor::randn(
        0f32,
        1f32,
        (args.batch, LATENT_CHANNELS, latent_h, latent_w),
        &device,
    )?;

    info!(warmups = args.warmups, "warming up");
    for _ in 0..args.warmups {
        let mut x = latent.clone();
        x = forward_slot(&mut pipe, Slot::UNet, &[x, cond.clone()])?;
        forward_slot(&mut pipe, Slot::VaeDecoder, &[x])?;
    }

    info!(steps = args.steps, "running the denoising loop");
    let start = Instant::now();
    let mut x = latent;
    for _ in 0..args.steps {
        x = forward_slot(&mut pipe, Slot::UNet, &[x, cond.clone()])?;
    }
    let elapsed = start.elapsed();

    let image = forward_slot(&mut pipe, Slot::VaeDecoder, &[x])?;
    println!("Output image shape: {:?}", image.dims());
    println!("Inference time: {:.3}s", elapsed.as_secs_f64());
    println!(
        "Iterations per second: {:.3}",
        args.steps as f64 / elapsed.as_secs_f64()
    );

    if let Some(dir) = &args.cache_dir {
        save_pipe(&pipe, dir, &ignores, true)?;
        info!(dir = %dir.display(), "saved compiled graphs");
    }

    Ok(())
}
