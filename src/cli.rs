use anyhow::Result;
use clap::Parser;
use tokio::runtime::Handle;

use crate::{
    coin::CoinDef,
    config::init_config,
    db::{reset_tables, TransactionStore as _},
    pay::{
        cold::{signing_request_from_qr_chunks, QR_TAG_SIGNING_REQUEST},
        encode_base64,
        paylink::PayLinkFlow,
        ReqwestHttp,
    },
    sync::{SyncEngine, SyncEvent},
    utils::data_split::{join_chunks, qr_size_limit, split},
};

/// The enum of sub-commands supported by the CLI
#[derive(Parser, Clone, Debug)]
pub enum Command {
    InitDb,
    Sync {
        address: String,
    },
    DownloadAll {
        address: String,
    },
    ListTxs {
        address: String,
    },
    SplitQr {
        payload: String,
        #[arg(long, default_value = QR_TAG_SIGNING_REQUEST)]
        tag: String,
        /// characters per code, overrides --low-res
        #[arg(long)]
        size: Option<usize>,
        #[arg(long)]
        low_res: bool,
    },
    JoinQr {
        chunks: Vec<String>,
        #[arg(long, default_value = QR_TAG_SIGNING_REQUEST)]
        tag: String,
    },
    ColdRequest {
        chunks: Vec<String>,
    },
    Paylink {
        uri: String,
        #[arg(long)]
        address: Option<String>,
    },
}

async fn run_sync(engine: &SyncEngine, address: &str, full: bool) -> Result<()> {
    let mut events = engine.subscribe();
    let started = if full {
        engine.download_all(address)
    } else {
        engine.enqueue(address)
    };
    if !started {
        println!("Nothing to do for {address}");
        return Ok(());
    }
    engine.wait_idle().await;
    while let Ok(event) = events.try_recv() {
        match event {
            SyncEvent::Progress { loaded, .. } => tracing::info!("{loaded} transactions loaded"),
            SyncEvent::Failed { error, .. } => anyhow::bail!(error),
            _ => {}
        }
    }
    Ok(())
}

#[tokio::main]
async fn process_command(command: Command, coin: &CoinDef) -> Result<()> {
    match command {
        Command::InitDb => {
            let connection = coin.connection()?;
            reset_tables(&connection)?;
        }
        Command::Sync { address } => {
            let engine = coin.sync_engine(Handle::current())?;
            run_sync(&engine, &address, false).await?;
        }
        Command::DownloadAll { address } => {
            let engine = coin.sync_engine(Handle::current())?;
            run_sync(&engine, &address, true).await?;
        }
        Command::ListTxs { address } => {
            let store = coin.store()?;
            let txs = store.list_transactions(&address)?;
            println!("{}", serde_json::to_string_pretty(&txs)?);
        }
        Command::SplitQr {
            payload,
            tag,
            size,
            low_res,
        } => {
            let size = size.unwrap_or_else(|| qr_size_limit(low_res));
            for chunk in split(&payload, size, &tag) {
                println!("{chunk}");
            }
        }
        Command::JoinQr { chunks, tag } => {
            println!("{}", join_chunks(&chunks, &tag)?);
        }
        Command::ColdRequest { chunks } => {
            let request = signing_request_from_qr_chunks(&chunks)?;
            println!("sender: {}", request.sender.as_deref().unwrap_or("-"));
            println!("reduced tx: {} bytes", request.reduced_tx.len());
            println!(
                "input boxes: {}",
                request.inputs.as_ref().map(|i| i.len()).unwrap_or_default()
            );
        }
        Command::Paylink { uri, address } => {
            let http = ReqwestHttp::new();
            let mut flow = PayLinkFlow::new(&uri)?;
            let request = flow.resolve(&http, address.as_deref()).await?;
            if let Some(message) = request.message.as_ref() {
                println!("{:?}: {message}", request.severity);
            }
            if let Some(reduced_tx) = request.reduced_tx.as_ref() {
                println!("reducedTx: {}", encode_base64(reduced_tx));
            }
            if let Some(reply_to) = request.reply_to.as_ref() {
                println!("replyTo: {reply_to}");
            }
        }
    }
    Ok(())
}

pub fn cli_main() -> Result<()> {
    let config = init_config()?;
    let coin = CoinDef::from_config(&config)?;
    let command = Command::parse();
    process_command(command, &coin)
}
