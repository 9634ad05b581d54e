// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::{WithdrawalAttestor, WithdrawalRequest};
use crate::crypto::{
    address_to_hex, parse_eth_address, parse_signature, recover_signer, sign, Vrs, VrsSignature,
};
use crate::error::{BridgeError, BridgeResult};
use crate::ledger::{LedgerBlock, LedgerClient, LedgerCommand, LedgerSubmitter};
use crate::metrics::NotaryMetrics;
use crate::registry::{AddressRegistry, AssetRegistry};
use crate::types::{SignatureBundle, WithdrawalProofRecord};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::H256;
use notary_bridge_keys::public_key_hex;
use std::sync::Arc;
use tap::TapFallible;
use tracing::{debug, info, warn};

/// Ledger account holding every notary's proof for one withdrawal.
pub fn proof_account_id(trigger_hash: &str, proof_domain: &str) -> String {
    let hash = trigger_hash.trim_start_matches("0x").to_lowercase();
    let name = hash.get(..32).unwrap_or(&hash);
    format!("{}@{}", name, proof_domain)
}

/// Signs every qualifying withdrawal seen on the ledger and publishes the
/// signature as a `WithdrawalProofRecord` keyed by this notary's address.
pub struct WithdrawalProofPublisher {
    attestor: Arc<WithdrawalAttestor>,
    wallets: Arc<AddressRegistry>,
    assets: Arc<AssetRegistry>,
    submitter: Arc<LedgerSubmitter>,
    wallet: LocalWallet,
    proof_domain: String,
    metrics: Arc<NotaryMetrics>,
}

impl WithdrawalProofPublisher {
    pub fn new(
        attestor: Arc<WithdrawalAttestor>,
        wallets: Arc<AddressRegistry>,
        assets: Arc<AssetRegistry>,
        submitter: Arc<LedgerSubmitter>,
        wallet: LocalWallet,
        proof_domain: impl Into<String>,
        metrics: Arc<NotaryMetrics>,
    ) -> Self {
        Self {
            attestor,
            wallets,
            assets,
            submitter,
            wallet,
            proof_domain: proof_domain.into(),
            metrics,
        }
    }

    /// Publish proofs for the withdrawals in `block`; returns how many records
    /// were written.
    pub async fn process_block(&self, block: &LedgerBlock) -> BridgeResult<usize> {
        let mut published = 0;
        for tx in &block.transactions {
            let hash = tx.hash();
            let Ok(request) =
                WithdrawalRequest::from_transaction(&hash, tx, self.attestor.trigger_account())
            else {
                continue;
            };
            if !self.qualifies(&request).await? {
                continue;
            }
            if self.publish(&request).await? {
                published += 1;
            }
        }
        Ok(published)
    }

    async fn qualifies(&self, request: &WithdrawalRequest) -> BridgeResult<bool> {
        if !self.assets.is_chain_a_token(&request.asset_id).await? {
            debug!(
                "[ProofPublisher] {} moves {} which is not bridged",
                request.trigger_hash, request.asset_id
            );
            return Ok(false);
        }
        if self
            .wallets
            .resolve_reverse(&request.src_account_id)
            .await?
            .is_none()
        {
            warn!(
                "[ProofPublisher] {} comes from {} which has no registered wallet",
                request.trigger_hash, request.src_account_id
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Returns false when the identical record is already on the ledger.
    pub async fn publish(&self, request: &WithdrawalRequest) -> BridgeResult<bool> {
        let attestation = self.attestor.attest(request).await?;
        let vrs = parse_signature(&sign(&self.wallet, attestation.hash)?)?;
        let record = attestation.proof_record(VrsSignature::from(&vrs));
        let value = serde_json::to_string(&record)
            .map_err(|e| BridgeError::BridgeSerializationError(e.to_string()))?;

        let client = self.submitter.client();
        let account = proof_account_id(&request.trigger_hash, &self.proof_domain);
        let key = address_to_hex(&self.wallet.address());
        let existing = client
            .account_detail(&account, self.submitter.creator(), &key)
            .await?;
        if existing.as_deref() == Some(value.as_str()) {
            debug!("[ProofPublisher] Proof for {} already published", request.trigger_hash);
            return Ok(false);
        }

        let set_detail = LedgerCommand::SetAccountDetail {
            account_id: account.clone(),
            key,
            value,
        };
        if client.account_exists(&account).await? {
            self.submitter.send(vec![set_detail]).await?;
        } else {
            let (account_name, domain_id) = account
                .split_once('@')
                .ok_or_else(|| BridgeError::InternalError(format!("bad account {}", account)))?;
            let create = LedgerCommand::CreateAccount {
                account_name: account_name.to_string(),
                domain_id: domain_id.to_string(),
                public_key: public_key_hex(self.wallet.signer()),
            };
            let created = self
                .submitter
                .send(vec![create, set_detail.clone()])
                .await;
            if let Err(e) = created {
                // another notary may have created the account first
                if !client.account_exists(&account).await? {
                    return Err(e);
                }
                self.submitter.send(vec![set_detail]).await?;
            }
        }
        self.metrics.withdrawal_proofs_published.inc();
        info!(
            "[ProofPublisher] Published proof for {} in {}",
            request.trigger_hash, account
        );
        Ok(true)
    }
}

/// Assemble a bundle from the proof records published under the proof
/// account of `trigger_hash`. Records whose signature does not recover to the
/// notary address they are keyed by are ignored.
pub async fn collect_published_proofs(
    ledger: &dyn LedgerClient,
    trigger_hash: &str,
    proof_domain: &str,
    writer: &str,
    attestation: H256,
) -> BridgeResult<SignatureBundle> {
    let account = proof_account_id(trigger_hash, proof_domain);
    let records = ledger.account_details(&account, writer).await?;
    let mut bundle = SignatureBundle::default();
    for (notary, value) in records {
        let vrs = match published_signature(&notary, &value, attestation) {
            Ok(vrs) => vrs,
            Err(e) => {
                warn!("[ProofPublisher] Ignoring proof of {} in {}: {:?}", notary, account, e);
                continue;
            }
        };
        if !bundle.contains(&vrs) {
            bundle.push(&vrs);
        }
    }
    if bundle.is_empty() {
        return Err(BridgeError::NoValidProof(format!(
            "no usable proof published for {}",
            trigger_hash
        )));
    }
    Ok(bundle)
}

fn published_signature(notary: &str, value: &str, attestation: H256) -> BridgeResult<Vrs> {
    let notary = parse_eth_address(notary)?;
    let record: WithdrawalProofRecord = serde_json::from_str(value)
        .map_err(|e| BridgeError::BridgeSerializationError(e.to_string()))?;
    let vrs = Vrs::try_from(&record.signature)?;
    let signer = recover_signer(attestation, &vrs).tap_err(|e| {
        debug!("[ProofPublisher] Unrecoverable signature from {:?}: {:?}", notary, e)
    })?;
    if signer != notary {
        return Err(BridgeError::InvalidSignatureEncoding(format!(
            "signed by {:?}, published as {:?}",
            signer, notary
        )));
    }
    Ok(vrs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{get_test_wallet, test_ledger, TestLedger};
    use crate::types::ETH_ASSET_ID;
    use ethers::types::{Address as EthAddress, U256};

    const ALICE: &str = "alice@domain";

    fn publisher(fixture: &TestLedger, seed: u8) -> WithdrawalProofPublisher {
        WithdrawalProofPublisher::new(
            fixture.attestor(),
            fixture.wallets(),
            fixture.assets(),
            fixture.notary_submitter(),
            get_test_wallet(seed),
            fixture.accounts.withdrawal_proof_domain.clone(),
            Arc::new(NotaryMetrics::new_for_testing()),
        )
    }

    #[test]
    fn test_proof_account_id() {
        let hash = "AB".repeat(32);
        assert_eq!(
            proof_account_id(&hash, "ethWithdrawalProof"),
            format!("{}@ethWithdrawalProof", "ab".repeat(16))
        );
        assert_eq!(
            proof_account_id(&format!("0x{}", hash), "d"),
            proof_account_id(&hash, "d")
        );
    }

    #[tokio::test]
    async fn test_every_notary_publishes_once() {
        let fixture = test_ledger();
        fixture.add_user(ALICE, ETH_ASSET_ID, "10");
        fixture.register_wallet(EthAddress::repeat_byte(0xaa), ALICE);
        let (hash, block) = fixture
            .withdraw(ALICE, ETH_ASSET_ID, "4", EthAddress::repeat_byte(0xbe))
            .await;

        let first = publisher(&fixture, 1);
        let second = publisher(&fixture, 2);
        assert_eq!(first.process_block(&block).await.unwrap(), 1);
        assert_eq!(second.process_block(&block).await.unwrap(), 1);
        // redelivery of the same block writes nothing new
        assert_eq!(first.process_block(&block).await.unwrap(), 0);

        let attestation = fixture
            .attestor()
            .attest(&fixture.attestor().request_for(&hash).await.unwrap())
            .await
            .unwrap();
        let bundle = collect_published_proofs(
            fixture.ledger.as_ref(),
            &hash,
            &fixture.accounts.withdrawal_proof_domain,
            &fixture.accounts.notary_account,
            attestation.hash,
        )
        .await
        .unwrap();
        assert_eq!(bundle.len(), 2);

        let records = fixture
            .ledger
            .account_details(
                &proof_account_id(&hash, &fixture.accounts.withdrawal_proof_domain),
                &fixture.accounts.notary_account,
            )
            .await
            .unwrap();
        let record: WithdrawalProofRecord = serde_json::from_str(
            &records[&address_to_hex(&get_test_wallet(1).address())],
        )
        .unwrap();
        assert_eq!(record.account_id, ALICE);
        assert_eq!(record.iroha_hash, hash);
        assert_eq!(record.amount, (U256::from(4) * U256::exp10(18)).to_string());
    }

    #[tokio::test]
    async fn test_transfers_without_wallet_are_not_signed() {
        let fixture = test_ledger();
        fixture.add_user(ALICE, ETH_ASSET_ID, "10");
        let (hash, block) = fixture
            .withdraw(ALICE, ETH_ASSET_ID, "1", EthAddress::repeat_byte(0xbe))
            .await;
        assert_eq!(publisher(&fixture, 1).process_block(&block).await.unwrap(), 0);
        let result = collect_published_proofs(
            fixture.ledger.as_ref(),
            &hash,
            &fixture.accounts.withdrawal_proof_domain,
            &fixture.accounts.notary_account,
            H256::repeat_byte(1),
        )
        .await;
        assert!(matches!(result, Err(BridgeError::NoValidProof(_))));
    }
}
