#![forbid(unsafe_code)]

//! Pipelined SET/GET load generator for a running quasar server.
//! Prints an hdrhistogram-backed latency summary as JSON.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Instant;

use hdrhistogram::Histogram;
use qs_protocol::{RespDecoder, pack_pipeline};
use serde::Serialize;

#[derive(Debug)]
struct Options {
    addr: String,
    requests: usize,
    pipeline: usize,
    value_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:6410".to_owned(),
            requests: 100_000,
            pipeline: 16,
            value_size: 64,
        }
    }
}

#[derive(Serialize)]
struct Summary {
    requests: usize,
    pipeline: usize,
    elapsed_ms: u64,
    requests_per_second: f64,
    latency_us: LatencySummary,
}

#[derive(Serialize)]
struct LatencySummary {
    p50: u64,
    p90: u64,
    p99: u64,
    p999: u64,
    max: u64,
}

fn summarize(histogram: &Histogram<u64>) -> LatencySummary {
    LatencySummary {
        p50: histogram.value_at_quantile(0.50),
        p90: histogram.value_at_quantile(0.90),
        p99: histogram.value_at_quantile(0.99),
        p999: histogram.value_at_quantile(0.999),
        max: histogram.max(),
    }
}

fn parse_options() -> Result<Options, String> {
    let mut options = Options::default();
    let mut args = std::env::args().skip(1);
    while let Some(flag) = args.next() {
        let mut value = |flag: &str| {
            args.next().ok_or_else(|| format!("{flag} needs a value"))
        };
        match flag.as_str() {
            "--addr" => options.addr = value(&flag)?,
            "--requests" => {
                options.requests = value(&flag)?
                    .parse()
                    .map_err(|_| "--requests must be a number".to_owned())?;
            }
            "--pipeline" => {
                options.pipeline = value(&flag)?
                    .parse()
                    .map_err(|_| "--pipeline must be a number".to_owned())?;
            }
            "--value-size" => {
                options.value_size = value(&flag)?
                    .parse()
                    .map_err(|_| "--value-size must be a number".to_owned())?;
            }
            other => return Err(format!("unknown flag {other}")),
        }
    }
    if options.pipeline == 0 {
        return Err("--pipeline must be at least 1".to_owned());
    }
    Ok(options)
}

/// Read until `expected` complete reply frames have been decoded.
fn read_replies(
    stream: &mut TcpStream,
    decoder: &mut RespDecoder,
    expected: usize,
) -> std::io::Result<()> {
    let mut seen = 0;
    let mut buf = [0_u8; 64 * 1024];
    while seen < expected {
        loop {
            match decoder.try_next() {
                Ok(Some(_)) => {
                    seen += 1;
                    if seen == expected {
                        return Ok(());
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        err.to_string(),
                    ));
                }
            }
        }
        let read = stream.read(&mut buf)?;
        if read == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "server closed mid-benchmark",
            ));
        }
        decoder.feed(&buf[..read]);
    }
    Ok(())
}

fn run(options: &Options) -> std::io::Result<Summary> {
    let mut stream = TcpStream::connect(&options.addr)?;
    stream.set_nodelay(true)?;
    let mut decoder = RespDecoder::new();
    let mut histogram: Histogram<u64> =
        Histogram::new_with_bounds(1, 60_000_000, 3).map_err(|err| {
            std::io::Error::other(err.to_string())
        })?;

    let payload = vec![b'x'; options.value_size];
    let started = Instant::now();
    let mut sent = 0;
    while sent < options.requests {
        let batch = options.pipeline.min(options.requests - sent);
        let mut commands = Vec::with_capacity(batch);
        for i in 0..batch {
            let key = format!("bench:{}", (sent + i) % 1024).into_bytes();
            if (sent + i) % 2 == 0 {
                commands.push(vec![b"SET".to_vec(), key, payload.clone()]);
            } else {
                commands.push(vec![b"GET".to_vec(), key]);
            }
        }
        let wire = pack_pipeline(&commands);
        let batch_started = Instant::now();
        stream.write_all(&wire)?;
        read_replies(&mut stream, &mut decoder, batch)?;
        let elapsed_us = batch_started.elapsed().as_micros() as u64;
        histogram
            .record(elapsed_us.max(1))
            .map_err(|err| std::io::Error::other(err.to_string()))?;
        sent += batch;
    }
    let elapsed = started.elapsed();
    let elapsed_ms = elapsed.as_millis() as u64;
    Ok(Summary {
        requests: options.requests,
        pipeline: options.pipeline,
        elapsed_ms,
        requests_per_second: options.requests as f64 / elapsed.as_secs_f64().max(1e-9),
        latency_us: summarize(&histogram),
    })
}

fn main() {
    let options = match parse_options() {
        Ok(options) => options,
        Err(err) => {
            eprintln!("qs-bench: {err}");
            std::process::exit(2);
        }
    };
    match run(&options) {
        Ok(summary) => match serde_json::to_string_pretty(&summary) {
            Ok(rendered) => println!("{rendered}"),
            Err(err) => eprintln!("qs-bench: {err}"),
        },
        Err(err) => {
            eprintln!("qs-bench: {err}");
            std::process::exit(1);
        }
    }
}
