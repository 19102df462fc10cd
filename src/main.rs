use anyhow::{Context as _, Result};
use clap::Parser;
use prost::Message as _;

use kvbuf::{
    config::{Cli, Command, Config, FetchArgs, OffsetCommand, SendArgs},
    logging::init_tracing,
    proto::{Errno, Request, proxy::proxy_client::ProxyClient},
    service::{open_log, open_log_read_only, run_server},
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cmd = cli.command.clone().unwrap_or(Command::Run);

    let log_dir = match cmd {
        Command::Run => cli.config.log_dir.as_deref(),
        _ => None,
    };
    let _logging =
        init_tracing(log_dir, cli.config.access_log_sampler()).context("init logging")?;

    match cmd {
        Command::Run => run_server(cli.config).await,
        Command::Send(args) => send(args).await,
        Command::Offset(offset) => offsets(&cli.config, offset).await,
        Command::Fetch(args) => fetch(&cli.config, args).await,
    }
}

async fn send(args: SendArgs) -> Result<()> {
    let mut request = Request {
        cmd: args.cmd,
        args: Vec::with_capacity(args.args.len()),
    };
    for arg in &args.args {
        let value = match arg.strip_prefix('@') {
            Some(path) => tokio::fs::read(path)
                .await
                .with_context(|| format!("read argument file {path}"))?,
            None => arg.as_bytes().to_vec(),
        };
        request.args.push(value);
    }

    if let Some(path) = &args.dump_path {
        tokio::fs::write(path, request.encode_to_vec())
            .await
            .with_context(|| format!("write {}", path.display()))?;
    }

    let mut client = ProxyClient::connect(args.addr.clone())
        .await
        .with_context(|| format!("connect to {}", args.addr))?;
    let resp = client.r#do(request).await.context("call Do")?.into_inner();
    println!("errno={} message={}", resp.errno().as_str_name(), resp.message);
    if resp.errno() != Errno::Ok {
        anyhow::bail!("request rejected: {}", resp.errno().as_str_name());
    }
    Ok(())
}

async fn offsets(config: &Config, cmd: OffsetCommand) -> Result<()> {
    let group = &config.consumer_group;

    if let OffsetCommand::Set { partition, offset } = cmd {
        // Takes the log lock, so this fails while a server is running.
        let log = open_log(config).await?;
        log.reset_offset(group, partition, offset)
            .await
            .with_context(|| format!("reset {group} partition {partition} to {offset}"))?;
        println!("group={group} partition={partition} committed={offset}");
        return Ok(());
    }

    let only = match cmd {
        OffsetCommand::Get { partition } => partition,
        OffsetCommand::Set { .. } => None,
    };
    let log = open_log_read_only(config).await?;
    let committed = log
        .committed_offsets(group)
        .await
        .with_context(|| format!("read committed offsets of {group}"))?;
    for (partition, high_watermark) in log.high_watermarks() {
        if only.is_some_and(|p| p != partition) {
            continue;
        }
        let offset = committed.get(&partition).copied().unwrap_or(0);
        println!(
            "group={group} partition={partition} committed={offset} high_watermark={high_watermark} lag={}",
            high_watermark - offset
        );
    }
    Ok(())
}

async fn fetch(config: &Config, args: FetchArgs) -> Result<()> {
    let log = open_log_read_only(config).await?;
    let record = log
        .read_at(args.partition, args.offset)
        .await
        .with_context(|| format!("read partition {} offset {}", args.partition, args.offset))?;

    println!(
        "topic={} partition={} offset={} timestamp={}",
        record.topic,
        record.partition,
        record.offset,
        record.timestamp.to_rfc3339()
    );
    println!("key={}", String::from_utf8_lossy(&record.key));
    match Request::decode(record.value.clone()) {
        Ok(req) => {
            println!("cmd={}", req.cmd);
            for (i, arg) in req.args.iter().enumerate() {
                println!("arg[{i}]={}", String::from_utf8_lossy(arg));
            }
        }
        Err(err) => println!("undecodable value ({} bytes): {err}", record.value.len()),
    }

    if let Some(path) = &args.dump_path {
        tokio::fs::write(path, &record.value)
            .await
            .with_context(|| format!("write {}", path.display()))?;
    }
    Ok(())
}
