// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::abi::{
    erc20_function, master_function, ADD_PEER_METHOD, BALANCE_OF_METHOD, PEERS_METHOD,
    TRANSFER_EVENT_TOPIC,
};
use crate::config::LedgerAccountsConfig;
use crate::crypto::address_to_hex;
use crate::error::{BridgeError, BridgeResult};
use crate::eth_client::ChainAClient;
use crate::ledger::{
    InMemoryLedger, LedgerBlock, LedgerClient, LedgerCommand, LedgerSubmitter,
};
use crate::registry::{AddressRegistry, AssetRegistry, PeerListProvider};
use crate::server::mock_handler::{run_mock_server, NotaryRequestMockHandler};
use crate::types::{
    ExpansionDetails, ETH_ADDRESS_KEY, ETH_ASSET_ID, ETH_PRECISION, FEE_DESCRIPTION,
    NOTARY_ENDPOINT_KEY, NOTARY_NAME_KEY,
};
use crate::withdrawal::WithdrawalAttestor;
use async_trait::async_trait;
use ethers::abi::Token;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address as EthAddress, Block, Bytes, Log, Transaction, TransactionReceipt, H256, U256, U64,
};
use ethers::utils::keccak256;
use hex_literal::hex;
use notary_bridge_config::local_ip_utils;
use notary_bridge_keys::public_key_hex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Once};
use tokio::task::JoinHandle;
use url::Url;

pub const TEST_TX_HASH: &str =
    "0x5a16b0c5fbc4f1b0b7e3a1a8f0a5cbd35c3f5bba2eb1c7f0a0e1dbf6a1c9d2e3";

pub const TEST_MASTER_CONTRACT: EthAddress =
    ethers::types::H160(hex!("5fbdb2315678afecb367f032d93f642f64180aa3"));

static INIT_LOGGING: Once = Once::new();

/// Installs a test-writer subscriber once per test binary.
pub fn init_for_testing() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Deterministic notary key; distinct seeds give distinct keys.
pub fn get_test_wallet(seed: u8) -> LocalWallet {
    let mut secret = [0x11u8; 32];
    secret[31] = seed;
    LocalWallet::from_bytes(&secret).unwrap()
}

pub fn empty_block(number: u64) -> Block<Transaction> {
    block_with(number, number, vec![])
}

pub fn block_with(number: u64, timestamp: u64, transactions: Vec<Transaction>) -> Block<Transaction> {
    Block {
        number: Some(U64::from(number)),
        hash: Some(H256::from_low_u64_be(number)),
        timestamp: U256::from(timestamp),
        transactions,
        ..Default::default()
    }
}

pub fn eth_tx(seed: u64, from: EthAddress, to: EthAddress, value: U256, input: Bytes) -> Transaction {
    Transaction {
        hash: H256::from_low_u64_be(seed),
        from,
        to: Some(to),
        value,
        input,
        ..Default::default()
    }
}

pub fn receipt_for(tx: &Transaction, status: u64, logs: Vec<Log>) -> TransactionReceipt {
    TransactionReceipt {
        transaction_hash: tx.hash,
        from: tx.from,
        to: tx.to,
        status: Some(U64::from(status)),
        logs,
        ..Default::default()
    }
}

pub fn transfer_log(token: EthAddress, from: EthAddress, to: EthAddress, amount: U256) -> Log {
    let mut data = [0u8; 32];
    amount.to_big_endian(&mut data);
    Log {
        address: token,
        topics: vec![TRANSFER_EVENT_TOPIC, H256::from(from), H256::from(to)],
        data: Bytes::from(data.to_vec()),
        ..Default::default()
    }
}

#[derive(Default)]
struct FakeChainState {
    latest: u64,
    blocks: HashMap<u64, Block<Transaction>>,
    receipts: HashMap<H256, TransactionReceipt>,
    nonce: U256,
    unavailable: bool,
    fail_sends: bool,
    revert_sends: bool,
    sent: Vec<TypedTransaction>,
    peers: HashSet<EthAddress>,
    // (token, owner) -> balance
    token_balances: HashMap<(EthAddress, EthAddress), U256>,
}

/// In-memory Chain A. Successful `addPeerByPeer` sends are reflected in the
/// `peers(address)` view; ERC20 `balanceOf` answers from `set_token_balance`.
pub struct FakeChainAClient {
    signer: LocalWallet,
    state: Mutex<FakeChainState>,
}

impl Default for FakeChainAClient {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeChainAClient {
    pub fn new() -> Self {
        Self {
            signer: get_test_wallet(0),
            state: Mutex::new(FakeChainState::default()),
        }
    }

    pub fn set_latest(&self, height: u64) {
        self.state.lock().unwrap().latest = height;
    }

    pub fn add_block(&self, block: Block<Transaction>) {
        let number = block.number.unwrap().as_u64();
        self.state.lock().unwrap().blocks.insert(number, block);
    }

    pub fn add_receipt(&self, receipt: TransactionReceipt) {
        self.state
            .lock()
            .unwrap()
            .receipts
            .insert(receipt.transaction_hash, receipt);
    }

    pub fn set_nonce(&self, nonce: U256) {
        self.state.lock().unwrap().nonce = nonce;
    }

    pub fn set_token_balance(&self, token: EthAddress, owner: EthAddress, balance: U256) {
        self.state
            .lock()
            .unwrap()
            .token_balances
            .insert((token, owner), balance);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.state.lock().unwrap().fail_sends = fail;
    }

    pub fn set_revert_sends(&self, revert: bool) {
        self.state.lock().unwrap().revert_sends = revert;
    }

    /// Transactions that reached the chain, reverted ones included.
    pub fn sent_transactions(&self) -> Vec<TypedTransaction> {
        self.state.lock().unwrap().sent.clone()
    }

    fn check_available(&self) -> BridgeResult<()> {
        if self.state.lock().unwrap().unavailable {
            return Err(BridgeError::ChainUnavailable("fake node is down".into()));
        }
        Ok(())
    }
}

fn calls(input: &[u8], method: &str) -> bool {
    input.len() >= 4 && master_function(method).unwrap().short_signature()[..] == input[..4]
}

#[async_trait]
impl ChainAClient for FakeChainAClient {
    async fn latest_block_number(&self) -> BridgeResult<u64> {
        self.check_available()?;
        Ok(self.state.lock().unwrap().latest)
    }

    async fn block_with_transactions(&self, number: u64) -> BridgeResult<Option<Block<Transaction>>> {
        self.check_available()?;
        Ok(self.state.lock().unwrap().blocks.get(&number).cloned())
    }

    async fn transaction_receipt(&self, tx_hash: H256) -> BridgeResult<Option<TransactionReceipt>> {
        self.check_available()?;
        Ok(self.state.lock().unwrap().receipts.get(&tx_hash).cloned())
    }

    async fn transaction_count(&self, _address: EthAddress) -> BridgeResult<U256> {
        self.check_available()?;
        Ok(self.state.lock().unwrap().nonce)
    }

    async fn send_transaction(&self, tx: TypedTransaction) -> BridgeResult<TransactionReceipt> {
        self.check_available()?;
        let mut state = self.state.lock().unwrap();
        if state.fail_sends {
            return Err(BridgeError::ProviderError("fake send failure".into()));
        }
        state.sent.push(tx.clone());
        if let Some(nonce) = tx.nonce() {
            if *nonce >= state.nonce {
                state.nonce = nonce + 1;
            }
        }
        let succeeded = !state.revert_sends;
        let input = tx.data().cloned().unwrap_or_default();
        if succeeded && calls(&input, ADD_PEER_METHOD) {
            let args = master_function(ADD_PEER_METHOD)
                .unwrap()
                .decode_input(&input[4..])
                .unwrap();
            if let Token::Address(peer) = args[0] {
                state.peers.insert(peer);
            }
        }
        let receipt = TransactionReceipt {
            transaction_hash: H256(keccak256(state.sent.len().to_be_bytes())),
            from: self.signer.address(),
            status: Some(U64::from(succeeded as u64)),
            ..Default::default()
        };
        state
            .receipts
            .insert(receipt.transaction_hash, receipt.clone());
        Ok(receipt)
    }

    async fn call(&self, tx: TypedTransaction) -> BridgeResult<Bytes> {
        self.check_available()?;
        let input = tx.data().cloned().unwrap_or_default();
        let balance_of = erc20_function(BALANCE_OF_METHOD).unwrap();
        if input.len() >= 4 && balance_of.short_signature()[..] == input[..4] {
            let token = match tx.to() {
                Some(ethers::types::NameOrAddress::Address(token)) => *token,
                _ => return Err(BridgeError::ProviderError("call without target".into())),
            };
            let owner = match balance_of.decode_input(&input[4..]).unwrap()[0] {
                Token::Address(owner) => owner,
                _ => unreachable!(),
            };
            let state = self.state.lock().unwrap();
            let balance = state
                .token_balances
                .get(&(token, owner))
                .copied()
                .unwrap_or_default();
            return Ok(ethers::abi::encode(&[Token::Uint(balance)]).into());
        }
        if !calls(&input, PEERS_METHOD) {
            return Err(BridgeError::ProviderError("unsupported call".into()));
        }
        let args = master_function(PEERS_METHOD)
            .unwrap()
            .decode_input(&input[4..])
            .unwrap();
        let is_peer = match args[0] {
            Token::Address(address) => self.state.lock().unwrap().peers.contains(&address),
            _ => false,
        };
        Ok(ethers::abi::encode(&[Token::Bool(is_peer)]).into())
    }

    fn signer_address(&self) -> EthAddress {
        self.signer.address()
    }
}

/// An in-memory ledger with every bridge account of the default config.
pub struct TestLedger {
    pub ledger: Arc<InMemoryLedger>,
    pub accounts: LedgerAccountsConfig,
    submitters: Mutex<HashMap<String, Arc<LedgerSubmitter>>>,
}

pub fn test_ledger() -> TestLedger {
    init_for_testing();
    let ledger = Arc::new(InMemoryLedger::new());
    let accounts = LedgerAccountsConfig::default();
    ledger
        .add_account(
            &accounts.notary_account,
            vec![public_key_hex(get_test_wallet(1).signer())],
            1,
        )
        .unwrap();
    for account in [
        &accounts.withdrawal_trigger_account,
        &accounts.withdrawal_billing_account,
        &accounts.wallets.storage_account,
        &accounts.wallets.setter_account,
        &accounts.relays.storage_account,
        &accounts.relays.setter_account,
        &accounts.chain_a_tokens.storage_account,
        &accounts.chain_a_tokens.setter_account,
        &accounts.ledger_tokens.storage_account,
        &accounts.ledger_tokens.setter_account,
        &accounts.notary_list.storage_account,
        &accounts.notary_list.setter_account,
        &accounts.expansion_trigger_account,
        &accounts.expansion_trigger_creator,
        &accounts.registration_trigger_account,
    ] {
        ledger.add_account(account, vec![], 1).unwrap();
    }
    ledger.add_asset(ETH_ASSET_ID, ETH_PRECISION).unwrap();
    TestLedger {
        ledger,
        accounts,
        submitters: Mutex::new(HashMap::new()),
    }
}

impl TestLedger {
    pub fn client(&self) -> Arc<dyn LedgerClient> {
        self.ledger.clone()
    }

    pub fn wallets(&self) -> Arc<AddressRegistry> {
        Arc::new(AddressRegistry::new(
            "WalletRegistry",
            self.client(),
            self.accounts.wallets.to_space(),
        ))
    }

    pub fn relays(&self) -> Arc<AddressRegistry> {
        Arc::new(AddressRegistry::new(
            "RelayRegistry",
            self.client(),
            self.accounts.relays.to_space(),
        ))
    }

    pub fn assets(&self) -> Arc<AssetRegistry> {
        Arc::new(AssetRegistry::new(
            self.client(),
            self.accounts.chain_a_tokens.to_space(),
            self.accounts.ledger_tokens.to_space(),
        ))
    }

    pub fn peer_list(&self) -> Arc<PeerListProvider> {
        Arc::new(PeerListProvider::new(
            self.client(),
            self.accounts.notary_list.to_space(),
        ))
    }

    pub fn attestor(&self) -> Arc<WithdrawalAttestor> {
        Arc::new(WithdrawalAttestor::new(
            self.client(),
            self.accounts.withdrawal_trigger_account.clone(),
            self.assets(),
            self.relays(),
        ))
    }

    /// One submitter per creator, so consecutive identical transactions get
    /// distinct creation times.
    pub fn submitter(&self, creator: &str) -> Arc<LedgerSubmitter> {
        self.submitters
            .lock()
            .unwrap()
            .entry(creator.to_string())
            .or_insert_with(|| Arc::new(LedgerSubmitter::new(self.client(), creator)))
            .clone()
    }

    pub fn notary_submitter(&self) -> Arc<LedgerSubmitter> {
        self.submitter(&self.accounts.notary_account)
    }

    pub fn register_wallet(&self, address: EthAddress, account_id: &str) {
        let space = &self.accounts.wallets;
        self.ledger
            .put_detail(
                &space.storage_account,
                &space.setter_account,
                &address_to_hex(&address),
                account_id,
            )
            .unwrap();
    }

    pub fn register_relay(&self, address: EthAddress, account_id: &str) {
        let space = &self.accounts.relays;
        self.ledger
            .put_detail(
                &space.storage_account,
                &space.setter_account,
                &address_to_hex(&address),
                account_id,
            )
            .unwrap();
    }

    pub fn register_chain_a_token(&self, token: EthAddress, asset_id: &str, precision: u32) {
        let space = &self.accounts.chain_a_tokens;
        self.ledger.add_asset(asset_id, precision).unwrap();
        self.ledger
            .put_detail(
                &space.storage_account,
                &space.setter_account,
                &address_to_hex(&token),
                asset_id,
            )
            .unwrap();
    }

    pub fn register_ledger_token(&self, token: EthAddress, asset_id: &str, precision: u32) {
        let space = &self.accounts.ledger_tokens;
        self.ledger.add_asset(asset_id, precision).unwrap();
        self.ledger
            .put_detail(
                &space.storage_account,
                &space.setter_account,
                &address_to_hex(&token),
                asset_id,
            )
            .unwrap();
    }

    pub fn add_peer(&self, name: &str, endpoint: &Url) {
        let space = &self.accounts.notary_list;
        self.ledger
            .put_detail(
                &space.storage_account,
                &space.setter_account,
                name,
                endpoint.as_str(),
            )
            .unwrap();
    }

    /// Creates `account_id` if needed and credits it with `amount`.
    pub fn add_user(&self, account_id: &str, asset_id: &str, amount: &str) {
        self.ledger.add_account(account_id, vec![], 1).unwrap();
        self.ledger.add_balance(account_id, asset_id, amount).unwrap();
    }

    /// Commits one transaction created by `creator`; returns its hash and block.
    pub async fn submit_as(&self, creator: &str, commands: Vec<LedgerCommand>) -> (String, LedgerBlock) {
        let hash = self
            .submitter(creator)
            .send(commands)
            .await
            .unwrap();
        let height = self.ledger.latest_height().await.unwrap();
        let block = self.ledger.block(height).await.unwrap().unwrap();
        (hash, block)
    }

    pub fn withdrawal_submitter(&self) -> Arc<LedgerSubmitter> {
        self.submitter(&self.accounts.withdrawal_trigger_account)
    }

    pub async fn withdraw(
        &self,
        src_account_id: &str,
        asset_id: &str,
        amount: &str,
        beneficiary: EthAddress,
    ) -> (String, LedgerBlock) {
        self.submit_as(
            src_account_id,
            vec![self.withdrawal_transfer(src_account_id, asset_id, amount, &address_to_hex(&beneficiary))],
        )
        .await
    }

    /// A withdrawal that also pays `fee` of the same asset to the trigger account.
    pub async fn withdraw_with_fee(
        &self,
        src_account_id: &str,
        asset_id: &str,
        amount: &str,
        fee: &str,
        beneficiary: EthAddress,
    ) -> (String, LedgerBlock) {
        self.submit_as(
            src_account_id,
            vec![
                self.withdrawal_transfer(src_account_id, asset_id, amount, &address_to_hex(&beneficiary)),
                self.withdrawal_transfer(src_account_id, asset_id, fee, FEE_DESCRIPTION),
            ],
        )
        .await
    }

    fn withdrawal_transfer(
        &self,
        src_account_id: &str,
        asset_id: &str,
        amount: &str,
        description: &str,
    ) -> LedgerCommand {
        LedgerCommand::TransferAsset {
            src_account_id: src_account_id.to_string(),
            dest_account_id: self.accounts.withdrawal_trigger_account.clone(),
            asset_id: asset_id.to_string(),
            description: description.to_string(),
            amount: amount.to_string(),
        }
    }

    /// Expansion of the notary account by a peer at `peer` with quorum 2.
    pub fn expansion_details(&self, peer: EthAddress, name: &str, endpoint: &str) -> ExpansionDetails {
        ExpansionDetails {
            account_id_to_expand: self.accounts.notary_account.clone(),
            public_key: hex::encode(keccak256(peer.as_bytes())),
            quorum: 2,
            additional_data: BTreeMap::from([
                (ETH_ADDRESS_KEY.to_string(), address_to_hex(&peer)),
                (NOTARY_NAME_KEY.to_string(), name.to_string()),
                (NOTARY_ENDPOINT_KEY.to_string(), endpoint.to_string()),
            ]),
        }
    }

    pub fn expansion_trigger_command(&self, details: &ExpansionDetails) -> LedgerCommand {
        LedgerCommand::SetAccountDetail {
            account_id: self.accounts.expansion_trigger_account.clone(),
            key: details.public_key.clone(),
            value: serde_json::to_string(details).unwrap(),
        }
    }
}

/// A URL on a free local port with nothing listening.
pub fn unused_local_url() -> Url {
    let port = local_ip_utils::get_available_port(&local_ip_utils::localhost_for_testing());
    Url::parse(&format!("http://127.0.0.1:{}", port)).unwrap()
}

/// Serves each handler on its own free port. Peers are named `notary-<i>`.
pub fn run_mock_notary_servers(
    handlers: Vec<NotaryRequestMockHandler>,
) -> (Vec<JoinHandle<()>>, Vec<(String, Url)>) {
    let mut handles = vec![];
    let mut peers = vec![];
    for (i, handler) in handlers.into_iter().enumerate() {
        let host = local_ip_utils::localhost_for_testing();
        let port = local_ip_utils::get_available_port(&host);
        let socket_address: SocketAddr = format!("{}:{}", host, port).parse().unwrap();
        handles.push(run_mock_server(socket_address, handler));
        peers.push((
            format!("notary-{}", i),
            Url::parse(&format!("http://{}", socket_address)).unwrap(),
        ));
    }
    (handles, peers)
}
