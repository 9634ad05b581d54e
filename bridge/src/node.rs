// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::chain_listener::{ChainAListener, FileCursorStore, ListenerConfig};
use crate::client::proof_collector::ProofCollector;
use crate::config::{NotaryNodeConfig, NotaryServerConfig};
use crate::error::BridgeError;
use crate::eth_client::ChainAClient;
use crate::eth_transaction_manager::ChainATransactionManager;
use crate::event_parser::{ChainAEventHandler, ChainAEventParser};
use crate::expansion::PeerExpansionProtocol;
use crate::ledger::{LedgerClient, LedgerSubmitter};
use crate::ledger_processor::LedgerBlockProcessor;
use crate::master_contract::MasterContract;
use crate::metrics::NotaryMetrics;
use crate::registration::WalletRegistrationHandler;
use crate::registry::{AddressRegistry, AssetRegistry, PeerListProvider};
use crate::server::{handler::NotaryRequestHandler, run_server, NotaryNodePublicMetadata};
use crate::types::ChainAEvent;
use crate::withdrawal::{
    WithdrawalAck, WithdrawalAttestor, WithdrawalLimitProvider, WithdrawalPipeline,
    WithdrawalProofPublisher,
};
use anyhow::anyhow;
use ethers::signers::Signer;
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// A Chain-A block the handler keeps failing on for this long stops the node.
const HANDLER_MAX_RETRY_TIME: Duration = Duration::from_secs(600);
const WITHDRAWAL_ACK_CHANNEL_SIZE: usize = 1000;

fn startup_error(what: &str, e: BridgeError) -> anyhow::Error {
    anyhow!("Failed to {}: {:?}", what, e)
}

struct Registries {
    wallets: Arc<AddressRegistry>,
    relays: Arc<AddressRegistry>,
    assets: Arc<AssetRegistry>,
    peers: Arc<PeerListProvider>,
}

async fn load_registries(
    ledger: &Arc<dyn LedgerClient>,
    config: &NotaryServerConfig,
) -> anyhow::Result<Registries> {
    let accounts = &config.ledger;
    let registries = Registries {
        wallets: Arc::new(AddressRegistry::new(
            "WalletRegistry",
            ledger.clone(),
            accounts.wallets.to_space(),
        )),
        relays: Arc::new(AddressRegistry::new(
            "RelayRegistry",
            ledger.clone(),
            accounts.relays.to_space(),
        )),
        assets: Arc::new(AssetRegistry::new(
            ledger.clone(),
            accounts.chain_a_tokens.to_space(),
            accounts.ledger_tokens.to_space(),
        )),
        peers: Arc::new(PeerListProvider::new(
            ledger.clone(),
            accounts.notary_list.to_space(),
        )),
    };
    let wallets = registries
        .wallets
        .load()
        .await
        .map_err(|e| startup_error("load wallets", e))?;
    let relays = registries
        .relays
        .load()
        .await
        .map_err(|e| startup_error("load relays", e))?;
    let assets = registries
        .assets
        .load()
        .await
        .map_err(|e| startup_error("load assets", e))?;
    info!(
        "Loaded {} wallets, {} relays and {} tokens from the ledger",
        wallets, relays, assets
    );
    Ok(registries)
}

async fn log_withdrawal_acks(mut acks: mpsc::Receiver<WithdrawalAck>) -> anyhow::Result<()> {
    while let Some(ack) = acks.recv().await {
        info!(
            "[Notifications] Withdrawal {} of {} {} by {} paid in Chain-A tx {:?} (block {:?}), finalized in ledger tx {}",
            ack.id,
            ack.amount,
            ack.asset_id,
            ack.src_account_id,
            ack.chain_a_tx_hash,
            ack.block_number,
            ack.finalization_hash
        );
    }
    Err(anyhow!("Withdrawal acknowledgement channel closed"))
}

/// Start every long running task of a notary: the signing server, the
/// Chain-A listener and the ledger block processor. The returned handles end
/// only on a fatal error.
pub async fn run_notary_node(
    config: NotaryNodeConfig,
    ledger: Arc<dyn LedgerClient>,
    version: &'static str,
    prometheus_registry: &prometheus::Registry,
) -> anyhow::Result<Vec<JoinHandle<anyhow::Result<()>>>> {
    let metrics = Arc::new(NotaryMetrics::new(prometheus_registry));
    let server_config = config.validate(metrics.clone()).await?;
    let accounts = server_config.ledger.clone();
    let wallet = server_config.wallet.clone();
    let chain_a_client: Arc<dyn ChainAClient> = server_config.chain_a_client.clone();
    let cancel = CancellationToken::new();

    let registries = load_registries(&ledger, &server_config).await?;
    let attestor = Arc::new(WithdrawalAttestor::new(
        ledger.clone(),
        accounts.withdrawal_trigger_account.clone(),
        registries.assets.clone(),
        registries.relays.clone(),
    ));
    let nonces = Arc::new(ChainATransactionManager::new(
        chain_a_client.clone(),
        metrics.clone(),
    ));
    let master = Arc::new(MasterContract::new(
        server_config.master_contract_address,
        nonces,
    ));
    let collector = Arc::new(ProofCollector::new(
        registries.peers.clone(),
        server_config.proof_collector.per_peer_timeout,
        metrics.clone(),
    ));
    let notary_submitter = Arc::new(LedgerSubmitter::new(
        ledger.clone(),
        accounts.notary_account.clone(),
    ));
    let registration_submitter = Arc::new(LedgerSubmitter::new(
        ledger.clone(),
        accounts.wallets.setter_account.clone(),
    ));
    let withdrawal_submitter = Arc::new(LedgerSubmitter::new(
        ledger.clone(),
        accounts.withdrawal_trigger_account.clone(),
    ));
    let handler = Arc::new(NotaryRequestHandler::new(
        wallet.clone(),
        ledger.clone(),
        attestor.clone(),
        &accounts,
        metrics.clone(),
    ));

    let mut handles = vec![];

    // Ledger side
    let pipeline = if server_config.withdrawal_service {
        info!("Running as withdrawal requester");
        let (acks_tx, acks_rx) = mpsc::channel(WITHDRAWAL_ACK_CHANNEL_SIZE);
        handles.push(tokio::spawn(log_withdrawal_acks(acks_rx)));
        Some(Arc::new(WithdrawalPipeline::new(
            attestor.clone(),
            collector.clone(),
            master.clone(),
            withdrawal_submitter.clone(),
            accounts.withdrawal_billing_account.clone(),
            acks_tx,
            metrics.clone(),
        )))
    } else {
        None
    };
    let processor = LedgerBlockProcessor::new(
        ledger.clone(),
        registries.wallets.clone(),
        registries.relays.clone(),
        registries.assets.clone(),
        Arc::new(PeerExpansionProtocol::new(
            &accounts,
            handler.clone(),
            collector,
            master,
            notary_submitter.clone(),
            server_config.expansion_submitter,
            metrics.clone(),
        )),
        Arc::new(WalletRegistrationHandler::new(
            &accounts,
            registries.wallets.clone(),
            registration_submitter,
            metrics.clone(),
        )),
        Arc::new(WithdrawalProofPublisher::new(
            attestor.clone(),
            registries.wallets.clone(),
            registries.assets.clone(),
            notary_submitter,
            wallet.clone(),
            accounts.withdrawal_proof_domain.clone(),
            metrics.clone(),
        )),
        pipeline,
        metrics.clone(),
    );
    let blocks = ledger.subscribe_blocks();
    let next_ledger_height = ledger
        .latest_height()
        .await
        .map_err(|e| startup_error("read ledger height", e))?
        + 1;
    let processor_cancel = cancel.clone();
    handles.push(tokio::spawn(async move {
        processor
            .run(blocks, next_ledger_height, processor_cancel)
            .await
            .map_err(|e| anyhow!("Ledger block processor stopped: {:?}", e))
    }));

    // Chain-A side
    let withdrawal_limits = match server_config.withdrawal_limits.clone() {
        Some(settings) => Some(Arc::new(
            WithdrawalLimitProvider::new(
                settings,
                withdrawal_submitter,
                chain_a_client.clone(),
                registries.assets.clone(),
                metrics.clone(),
            )
            .await
            .map_err(|e| startup_error("load withdrawal limit", e))?,
        )),
        None => None,
    };
    let (events_tx, mut events_rx) = mpsc::channel(server_config.ledger_block_channel_size);
    let parser = ChainAEventParser::new(
        server_config.master_contract_address,
        chain_a_client.clone(),
        registries.wallets.clone(),
        registries.relays.clone(),
        registries.assets.clone(),
    );
    let mut event_handler = ChainAEventHandler::new(parser, events_tx, metrics.clone());
    if let Some(limits) = withdrawal_limits {
        event_handler = event_handler.with_withdrawal_limits(limits);
    }
    let listener = ChainAListener::new(
        ListenerConfig {
            start_block: server_config.chain_a.start_block,
            confirmation_lag: server_config.chain_a.confirmation_lag,
            ignore_start_block: server_config.chain_a.ignore_start_block,
            poll_interval: server_config.chain_a.poll_interval,
            channel_size: server_config.ledger_block_channel_size,
            handler_max_retry_time: HANDLER_MAX_RETRY_TIME,
        },
        chain_a_client,
        Arc::new(FileCursorStore::new(
            server_config.chain_a.cursor_file_path.clone(),
        )),
        Arc::new(event_handler),
        metrics.clone(),
    )
    .await
    .map_err(|e| startup_error("start Chain-A listener", e.into_bridge_error()))?;
    let listener_cancel = cancel.clone();
    handles.push(tokio::spawn(async move {
        listener
            .run(listener_cancel)
            .await
            .map_err(|e| anyhow!("Chain-A listener stopped: {}", e))
    }));
    handles.push(tokio::spawn(async move {
        // issuance on the ledger happens downstream of the notary
        while let Some(event) = events_rx.recv().await {
            match event {
                ChainAEvent::Deposit {
                    tx_hash,
                    beneficiary_account,
                    asset_id,
                    decimal_amount,
                    ..
                } => info!(
                    "[ChainAEvents] Deposit {:?}: {} {} for {}",
                    tx_hash, decimal_amount, asset_id, beneficiary_account
                ),
                ChainAEvent::WithdrawalFinalized {
                    trigger_tx_hash,
                    block_number,
                    ..
                } => info!(
                    "[ChainAEvents] Withdrawal {:?} finalized in block {}",
                    trigger_tx_hash, block_number
                ),
            }
        }
        warn!("[ChainAEvents] Event stream ended");
        Ok(())
    }));

    // Start Server
    let socket_address = SocketAddr::new(
        IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
        server_config.server_listen_port,
    );
    let metadata = NotaryNodePublicMetadata::new(
        version,
        server_config.notary_name.clone(),
        wallet.address(),
    );
    handles.push(run_server(
        &socket_address,
        handler,
        metrics,
        Arc::new(metadata),
    ));
    Ok(handles)
}
