extern crate chrono;
use chrono::offset::Local;
use chrono::DateTime;

use std::time::SystemTime;

use clap::Parser;
use env_logger;
use log::info;

use mipi_camera::config::CameraConfig;
use mipi_camera::image_sensor::{LoggingSensorControl, SyntheticSensor};
use mipi_camera::pipeline;

/// Utility program that runs the full pipeline against a synthetic sensor,
/// captures one decimated image and writes it out.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Path of the output image (extension selects the format).
    #[arg(short, long)]
    output: String,

    /// Optional input image; mosaiced to the sensor geometry. Defaults to a
    /// uniform mid-gray field.
    #[arg(short, long)]
    input: Option<String>,

    /// Number of frames to stream; the control loop gets one correction step
    /// per frame before the capture is taken.
    #[arg(short, long, default_value_t = 4)]
    frames: usize,
}

#[tokio::main]
async fn main() {
    // If any thread panics, bail out.
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Thread panicked: {}", panic_info);
        std::process::exit(1);
    }));
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = CameraConfig::default();
    let sensor = match &args.input {
        Some(path) => {
            let image = image::open(path).unwrap().to_rgb8();
            SyntheticSensor::from_rgb(&image, &config).unwrap()
        }
        None => SyntheticSensor::uniform(128, &config),
    };

    let (pipeline, io) = pipeline::start(config, Box::new(LoggingSensorControl)).unwrap();
    let streamer = tokio::spawn(sensor.stream_frames(io, args.frames));

    let captured = pipeline.capture.capture_image().await.unwrap();
    let readout_time = SystemTime::now();
    info!("captured {}x{} working image", captured.width, captured.height);

    captured.to_rgb().save(&args.output).unwrap();

    let datetime: DateTime<Local> = readout_time.into();
    info!("Image obtained at {} written to {}",
          datetime.format("%d/%m/%Y %T"), args.output);

    streamer.await.unwrap();
    pipeline.join().await;
}
