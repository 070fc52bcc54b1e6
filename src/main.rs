use media::{
    pipe::Pipe,
    types::{PipeConfig, PipeEvent, PipeSummary},
};

mod config;
mod media;

#[cfg(not(any(feature = "symphonia", feature = "ffmpeg")))]
compile_error!("enable the `symphonia` or `ffmpeg` feature");

fn init_logging(level: log::LevelFilter) {
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .filter_module("demux_bus", level)
        .filter_module("symphonia", log::LevelFilter::Warn)
        .init();
}

fn usage() -> ! {
    eprintln!("usage: lite-demux <file> [--decode]");
    std::process::exit(2);
}

fn print_event(event: &PipeEvent) {
    match event {
        PipeEvent::Frame(frame) => println!("frame  {}", frame),
        PipeEvent::Audio(buffer) => println!("audio  {}", buffer),
    }
}

fn print_summary(summary: &PipeSummary) {
    for stream in &summary.streams {
        println!("stream {}", stream);
    }
    println!(
        "total  {} frames, {} bytes, {} buffers, {} samples/channel",
        summary.frames, summary.bytes, summary.buffers, summary.samples
    );
}

#[tokio::main]
async fn main() -> ! {
    let config = config::config();
    init_logging(config.log_level());
    #[cfg(feature = "ffmpeg")]
    demux_bus::init().unwrap_or_else(|e| {
        eprintln!("Error initialising ffmpeg: {:#}", e);
        std::process::exit(1);
    });

    let mut path = None;
    let mut decode = config.decode();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--decode" => decode = true,
            "-h" | "--help" => usage(),
            _ if path.is_none() => path = Some(arg),
            _ => usage(),
        }
    }
    let Some(path) = path else { usage() };

    let pipe_config = PipeConfig::builder()
        .input_file(path)
        .chunk_size(config.chunk_size())
        .decode(decode)
        .options(config.pipeline_options())
        .build()
        .unwrap_or_else(|e| {
            eprintln!("Error building pipeline: {:#}", e);
            std::process::exit(2);
        });
    let pipe = Pipe::new(pipe_config);

    let run = pipe.run(print_event);
    tokio::pin!(run);
    let result = loop {
        tokio::select! {
            result = &mut run => break result,
            _ = tokio::signal::ctrl_c(), if !pipe.is_cancelled() => {
                pipe.cancel();
            },
        }
    };

    match result {
        Ok(summary) => {
            print_summary(&summary);
            std::process::exit(0);
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}
