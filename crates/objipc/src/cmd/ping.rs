use std::time::Instant;

use serde::Serialize;

use objipc_client::Runtime;

use crate::cmd::PingArgs;
use crate::exit::{client_error, CliResult, SUCCESS};
use crate::output::OutputFormat;

#[derive(Serialize)]
struct PingOutput {
    roundtrips: u32,
    min_us: u128,
    max_us: u128,
    mean_us: u128,
}

pub fn run(args: PingArgs, format: OutputFormat) -> CliResult<i32> {
    let runtime =
        Runtime::connect(args.socket.as_deref()).map_err(|e| client_error("connect", e))?;

    let mut samples = Vec::with_capacity(args.count as usize);
    for _ in 0..args.count.max(1) {
        let start = Instant::now();
        runtime
            .roundtrip()
            .map_err(|e| client_error("roundtrip", e))?;
        samples.push(start.elapsed().as_micros());
    }

    let min = samples.iter().copied().min().unwrap_or(0);
    let max = samples.iter().copied().max().unwrap_or(0);
    let mean = samples.iter().sum::<u128>() / samples.len().max(1) as u128;
    let output = PingOutput {
        roundtrips: samples.len() as u32,
        min_us: min,
        max_us: max,
        mean_us: mean,
    };

    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string(&output).unwrap_or_else(|_| "{}".to_string())
        ),
        OutputFormat::Pretty => println!(
            "{} roundtrips: min {} us, mean {} us, max {} us",
            output.roundtrips, output.min_us, output.mean_us, output.max_us
        ),
        OutputFormat::Raw => println!("{}", output.mean_us),
    }

    Ok(SUCCESS)
}
