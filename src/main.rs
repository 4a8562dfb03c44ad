// Copyright Motia LLC and/or licensed to Motia LLC under one or more
// contributor license agreements. Licensed under the Elastic License 2.0;
// you may not use this file except in compliance with the Elastic License 2.0.
// This software is patent protected. We welcome discussions - reach out at support@motia.dev
// See LICENSE and PATENTS files for details.

use clap::Parser;
use cloudfn::{EngineBuilder, logging};

#[derive(Parser, Debug)]
#[command(name = "cloudfn", about = "TypeScript cloud functions runtime")]
struct Args {
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Overrides `server.host` and `server.port`.
    #[arg(short, long)]
    address: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_log();
    let args = Args::parse();

    let mut builder = EngineBuilder::new().config_file_or_default(&args.config)?;
    if let Some(address) = &args.address {
        builder = builder.address(address);
    }
    builder.build().await?.serve().await
}
