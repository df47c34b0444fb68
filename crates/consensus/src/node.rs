use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ed25519_dalek::{SigningKey, VerifyingKey};
use metrics as sequencer_metrics;
use mempool::{InsertOutcome, Mempool};
use networking::{sign_hash, verify_signature, Message, PublicKeyRegistry, Transport};
use storage::{AccountStore, ChainStore};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use types::{
    block_hash, merkle_proof, merkle_root, Address, Block, BlockSignature, FinancialTx, Hash,
    IntervalValidations, MlBlockExt, ModelData, Transaction,
};

use crate::config::{Flavor, NodeConfig};
use crate::error::ConsensusError;
use crate::flavor::{FinancialValidator, MlValidator, TxValidator};
use crate::interval;
use crate::phase::{Phase, PhaseGate};
use crate::round::RoundState;
use crate::skeleton::{self, SKELETON_SIGNATURE_SLACK};

/// The Consensus Coordinator (C4), wrapping the Round State Machine (C1),
/// the mempool (C3) and chain storage behind the phase-gated handlers
/// described in spec §4.4, plus the Skeleton Propagator (C6) and the
/// transaction-acceptance path (§4.4.5).
///
/// Generic over the mempool and storage backends so tests can swap in
/// in-memory implementations; the transport and key registry are always
/// injected as trait objects (spec §9: "inject them rather than using
/// file-scope globals").
pub struct Node<M, S>
where
    M: Mempool + Send + 'static,
    S: ChainStore + AccountStore + Send + 'static,
{
    pub config: NodeConfig,
    mempool: Mutex<M>,
    storage: Mutex<S>,
    phase: PhaseGate,
    round: Mutex<RoundState>,
    local_peers: RwLock<Vec<Address>>,
    transport: Arc<dyn Transport>,
    registry: PublicKeyRegistry,
    signing_key: SigningKey,
    validator: Box<dyn TxValidator>,
    wallet_subscriptions: RwLock<HashSet<types::AccountKey>>,
}

/// Pick the argmax of `votes` by count, favoring the first-seen entry on a
/// tie (spec §4.4.8 step 4). `votes` is ordered local-hash-first (see
/// `tally_quorum_sigs`), so this is what makes ties resolve to the local
/// candidate rather than whichever non-local hash happened to tie last.
/// Deliberately not `Iterator::max_by_key`, which returns the *last*
/// maximal element on a tie, the opposite of what's wanted here.
fn select_winning_hash(votes: Vec<(String, u32)>) -> Option<(String, u32)> {
    votes.into_iter().fold(None, |best, (hash, count)| match best {
        Some((best_hash, best_count)) if best_count >= count => Some((best_hash, best_count)),
        _ => Some((hash, count)),
    })
}

impl<M, S> Node<M, S>
where
    M: Mempool + Send + 'static,
    S: ChainStore + AccountStore + Send + 'static,
{
    pub fn new(
        config: NodeConfig,
        mempool: M,
        storage: S,
        transport: Arc<dyn Transport>,
        registry: PublicKeyRegistry,
        signing_key: SigningKey,
    ) -> Self {
        let validator: Box<dyn TxValidator> = match config.flavor {
            Flavor::Financial => Box::new(FinancialValidator),
            Flavor::Ml => Box::new(MlValidator),
        };
        let local_peers: Vec<Address> = config.local_peers();

        Self {
            config,
            mempool: Mutex::new(mempool),
            storage: Mutex::new(storage),
            phase: PhaseGate::new(Phase::Idle),
            round: Mutex::new(RoundState::default()),
            local_peers: RwLock::new(local_peers),
            transport,
            registry,
            signing_key,
            validator,
            wallet_subscriptions: RwLock::new(HashSet::new()),
        }
    }

    pub async fn tip(&self) -> Block {
        self.storage.lock().await.tip()
    }

    pub async fn chain_height(&self) -> u64 {
        self.tip().await.block_id
    }

    pub async fn get_block(&self, block_id: u64) -> Option<Block> {
        self.storage.lock().await.get_block(block_id).ok()
    }

    pub async fn mempool_len(&self) -> usize {
        self.mempool.lock().await.len()
    }

    pub async fn balance(&self, account: &types::AccountKey) -> u64 {
        self.storage.lock().await.balance(account)
    }

    pub async fn current_phase(&self) -> Phase {
        self.phase.current().await
    }

    pub async fn local_peers_snapshot(&self) -> Vec<Address> {
        self.local_peers.read().await.clone()
    }

    /// The Quorum Selector (C2) applied to the current tip.
    pub async fn current_quorum(&self) -> Vec<Address> {
        let tip = self.tip().await;
        quorum::derive_quorum(&tip, 0, &self.config.global_peers, self.config.quorum_member_count())
    }

    pub async fn in_quorum(&self) -> bool {
        self.current_quorum().await.contains(&self.config.address)
    }

    pub async fn register_public_key(&self, addr: Address, key: VerifyingKey) {
        self.registry.write_public_key(addr, key);
    }

    pub async fn subscribe_wallet(&self, account: types::AccountKey) {
        self.wallet_subscriptions.write().await.insert(account);
    }

    /// Bounded-sleep poll for mempool refill (spec §4.7 step 5), invoked
    /// after `add_block` for a node that is in the next round's quorum.
    /// There is no cancellation (spec §5): it runs until the condition is
    /// met, then kicks off `send_quorum_ready`.
    pub async fn maybe_start_round(self: &Arc<Self>) {
        loop {
            let eligible = self.current_phase().await == Phase::Idle
                && self.in_quorum().await
                && self.mempool_len().await >= self.config.minimum_transactions;
            if eligible {
                if let Err(e) = self.send_quorum_ready().await {
                    warn!(error = %e, "send_quorum_ready failed");
                }
                return;
            }
            tokio::time::sleep(self.config.phase_poll_interval).await;
        }
    }

    // ---- §4.4.1 send_quorum_ready (IDLE -> READY) ----
    pub async fn send_quorum_ready(self: &Arc<Self>) -> Result<(), ConsensusError> {
        self.phase.set(Phase::Ready).await;
        {
            let mut round = self.round.lock().await;
            round.quorum_sigs.clear();
            round.quorum_ready_votes = 0;
            round.started_at = Some(std::time::Instant::now());
        }

        let quorum = self.current_quorum().await;
        let my_tip = self.tip().await;

        for peer in quorum.iter().filter(|a| **a != self.config.address) {
            match self.transport.send_two_way(peer, Message::QuorumReady).await {
                Ok(Message::Ping) => {}
                Ok(Message::ReconcileBlockFull { block_id, .. }) => {
                    let reply = if block_id < my_tip.block_id {
                        Message::ReconcileBlockId { block_id: my_tip.block_id }
                    } else {
                        Message::Ping
                    };
                    let _ = self.transport.send_one_way(peer, reply).await;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(%peer, error = %e, "quorum-ready exchange failed; continuing with remaining peers");
                }
            }
        }

        // Spec §8 boundary "QUORUM_SIZE = 1": with no other quorum members
        // to reply, `quorum_ready_votes` never gets incremented by
        // `handle_quorum_ready_request` (nothing arrives), so the threshold
        // of `|quorum| - 1` is already trivially met. Check it here too,
        // rather than relying solely on the receive-side handler, or a
        // singleton quorum would stall in READY forever.
        let quorum_len = quorum.len();
        let threshold_already_met = {
            let round = self.round.lock().await;
            round.quorum_ready_votes >= quorum_len.saturating_sub(1)
        };
        if threshold_already_met {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = this.send_mempool_hashes().await {
                    warn!(error = %e, "send_mempool_hashes failed");
                }
            });
        }
        Ok(())
    }

    // ---- §4.4.2 receive_quorum_ready (gated on READY) ----
    pub async fn handle_quorum_ready_request(self: &Arc<Self>) -> Option<Message> {
        if self
            .phase
            .wait_for(Phase::Ready, self.config.phase_wait_timeout, self.config.phase_poll_interval)
            .await
            .is_err()
        {
            return None;
        }

        if !self.in_quorum().await {
            let tip = self.tip().await;
            let hash = block_hash(&tip, 0);
            return Some(Message::ReconcileBlockFull { block_id: tip.block_id, block_hash: hash });
        }

        let quorum_len = self.current_quorum().await.len();
        let reached_threshold = {
            let mut round = self.round.lock().await;
            round.quorum_ready_votes += 1;
            if round.quorum_ready_votes >= quorum_len.saturating_sub(1) {
                round.quorum_ready_votes = 0;
                true
            } else {
                false
            }
        };
        if reached_threshold {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = this.send_mempool_hashes().await {
                    warn!(error = %e, "send_mempool_hashes failed");
                }
            });
        }
        Some(Message::Ping)
    }

    // ---- §4.4.3 send_mempool_hashes (READY -> MEMPOOL_SYNC) ----
    pub async fn send_mempool_hashes(self: &Arc<Self>) -> Result<(), ConsensusError> {
        self.phase.set(Phase::MempoolSync).await;
        {
            let mut round = self.round.lock().await;
            round.mempool_rounds = 0;
        }

        let digests: Vec<Hash> = {
            let mempool = self.mempool.lock().await;
            mempool.snapshot_keys().into_iter().collect()
        };
        let quorum = self.current_quorum().await;

        for peer in quorum.iter().filter(|a| **a != self.config.address) {
            let req = Message::ReceiveMempoolRequest { digests: digests.clone() };
            match self.transport.send_two_way(peer, req).await {
                Ok(Message::Ping) => {}
                Ok(Message::RequestTransaction { missing }) => {
                    let txs: Vec<Transaction> = {
                        let mempool = self.mempool.lock().await;
                        missing.iter().filter_map(|d| mempool.get(d).cloned()).collect()
                    };
                    let _ = self
                        .transport
                        .send_one_way(peer, Message::ReceiveMempoolReply { txs })
                        .await;
                }
                Ok(_) => {}
                Err(e) => warn!(%peer, error = %e, "mempool-hash exchange failed; continuing"),
            }
        }

        // Same degenerate-quorum reasoning as `send_quorum_ready`: with no
        // other members, `mempool_rounds` stays at its reset value of 0 and
        // the threshold is already met.
        let quorum_len = quorum.len();
        let threshold_already_met = {
            let round = self.round.lock().await;
            round.mempool_rounds >= quorum_len.saturating_sub(1)
        };
        if threshold_already_met {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = this.construct_block().await {
                    warn!(error = %e, "construct_block failed");
                }
            });
        }
        Ok(())
    }

    // ---- §4.4.4 receive_mempool (gated on MEMPOOL_SYNC) ----
    pub async fn handle_receive_mempool_request(
        self: &Arc<Self>,
        digests: Vec<Hash>,
    ) -> Option<Message> {
        if self
            .phase
            .wait_for(
                Phase::MempoolSync,
                self.config.phase_wait_timeout,
                self.config.phase_poll_interval,
            )
            .await
            .is_err()
        {
            return None;
        }

        let local_keys = self.mempool.lock().await.snapshot_keys();
        let missing: Vec<Hash> = digests.into_iter().filter(|d| !local_keys.contains(d)).collect();

        if missing.is_empty() {
            self.note_mempool_round_complete().await;
            return Some(Message::Ping);
        }
        Some(Message::RequestTransaction { missing })
    }

    /// Handles the follow-up `RECEIVE_MEMPOOL(txs)` reply to our earlier
    /// `REQUEST_TRANSACTION`, arriving as a one-way message.
    pub async fn handle_receive_mempool_reply(self: &Arc<Self>, txs: Vec<Transaction>) {
        if self
            .phase
            .wait_for(
                Phase::MempoolSync,
                self.config.phase_wait_timeout,
                self.config.phase_poll_interval,
            )
            .await
            .is_err()
        {
            return;
        }

        let storage = self.storage.lock().await;
        let committed = storage.committed_digests();
        let mut mempool = self.mempool.lock().await;
        for tx in txs {
            if self.validator.validate(&tx, &[], &*storage).is_ok() {
                let _ = mempool.insert(tx, &committed);
            }
        }
        drop(mempool);
        drop(storage);

        self.note_mempool_round_complete().await;
    }

    async fn note_mempool_round_complete(self: &Arc<Self>) {
        let quorum_len = self.current_quorum().await.len();
        let reached = {
            let mut round = self.round.lock().await;
            round.mempool_rounds += 1;
            if round.mempool_rounds >= quorum_len.saturating_sub(1) {
                round.mempool_rounds = 0;
                true
            } else {
                false
            }
        };
        if reached {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = this.construct_block().await {
                    warn!(error = %e, "construct_block failed");
                }
            });
        }
    }

    // ---- §4.4.6 construct_block (MEMPOOL_SYNC -> BUILDING) ----
    pub async fn construct_block(self: &Arc<Self>) -> Result<(), ConsensusError> {
        self.phase.set(Phase::Building).await;

        let tip = self.tip().await;
        let storage = self.storage.lock().await;
        let mempool = self.mempool.lock().await;
        let snapshot: Vec<Transaction> = mempool
            .snapshot_keys()
            .into_iter()
            .filter_map(|d| mempool.get(&d).cloned())
            .collect();
        drop(mempool);

        // Fixed-point acceptance pass (spec §4.4.6 step 1's "internally
        // consistent" requirement): a single linear scan would reject a
        // transaction that only becomes feasible once an *earlier-arriving
        // but later-scanned* transaction in this same batch is accepted
        // (e.g. B spends funds A sends it in the same round). Mempool
        // iteration order is unspecified (digest-keyed), so re-scan the
        // remainder until a pass makes no further progress.
        let mut candidates = snapshot;
        let mut accepted: Vec<Transaction> = Vec::new();
        loop {
            let mut remaining = Vec::new();
            let mut progressed = false;
            for tx in candidates {
                if self.validator.validate(&tx, &accepted, &*storage).is_ok() {
                    accepted.push(tx);
                    progressed = true;
                } else {
                    remaining.push(tx);
                }
            }
            candidates = remaining;
            if !progressed || candidates.is_empty() {
                break;
            }
        }
        for _ in &candidates {
            debug!("dropping mempool entry that failed re-validation at block construction");
        }
        drop(storage);

        let ml_ext = if self.config.flavor == Flavor::Ml {
            let model = accepted.iter().find_map(|tx| tx.as_ml().map(|m| m.model.clone()));
            match model {
                Some(model) => {
                    let (interval_validations, all_valid) =
                        self.run_interval_validation(&model, &tip).await;
                    Some(MlBlockExt { interval_validations, all_valid })
                }
                None => Some(MlBlockExt::genesis()),
            }
        } else {
            None
        };

        let mut tx_map = HashMap::new();
        for tx in accepted {
            tx_map.insert(tx.digest(), tx);
        }

        let block = Block {
            block_id: tip.block_id + 1,
            prev_hash: block_hash(&tip, 0),
            tx_map,
            merkle_root: None,
            ml: ml_ext,
        };

        {
            let mut round = self.round.lock().await;
            round.quorum_block = Some(block.clone());
        }

        self.send_sig_of_block_hash(&block).await
    }

    // ---- §4.5 Interval Validator (ML flavor) ----
    async fn run_interval_validation(
        self: &Arc<Self>,
        model: &ModelData,
        tip: &Block,
    ) -> (IntervalValidations, bool) {
        // Every interval is assigned to exactly one quorum member
        // (`assign_intervals` is a round-robin-by-interval partition), so
        // the number of vote events this node will ever see in a round is
        // the interval count, not `|quorum|` — with fewer intervals than
        // quorum members the latter is never reached.
        let expected = interval::task_intervals(model).len();
        {
            let mut round = self.round.lock().await;
            round.validation_votes.clear();
            round.validation_responses = 0;
            round.validation_complete = false;
            round.validation_expected = Some(expected);
        }

        let quorum = self.current_quorum().await;
        let hash = block_hash(tip, 0);
        let my_intervals = interval::assign_intervals(model, &hash, &quorum, &self.config.address);

        for idx in &my_intervals {
            let mut verdict = model.intervals_validity.get(*idx as usize).copied().unwrap_or(false);
            if self.config.is_malicious {
                verdict = !verdict;
            }

            for peer in quorum.iter().filter(|a| **a != self.config.address) {
                let _ = self
                    .transport
                    .send_one_way(
                        peer,
                        Message::ReceiveIntervalValidation { interval_idx: *idx, is_valid: verdict },
                    )
                    .await;
            }
            // Self-vote invariant (spec §9): only this local path mutates
            // validation state; the broadcast above is a pure side effect.
            self.record_interval_vote(*idx, verdict).await;
        }

        loop {
            {
                let round = self.round.lock().await;
                if round.validation_complete {
                    return (round.interval_validations.clone(), round.all_valid);
                }
            }
            tokio::time::sleep(self.config.phase_poll_interval).await;
        }
    }

    async fn record_interval_vote(self: &Arc<Self>, interval_idx: u32, is_valid: bool) {
        let mut round = self.round.lock().await;
        round.validation_votes.entry(interval_idx).or_default().push(is_valid);
        round.validation_responses += 1;
        if let Some(expected) = round.validation_expected {
            if round.validation_responses >= expected {
                let (result, all_valid) = interval::tally_intervals(&round.validation_votes);
                round.interval_validations = result;
                round.all_valid = all_valid;
                round.validation_complete = true;
                round.validation_votes.clear();
            }
        }
    }

    /// Dispatch target for an inbound `RECEIVE_INTERVAL_VALIDATION`
    /// one-way message from a peer.
    pub async fn handle_receive_interval_validation(self: &Arc<Self>, interval_idx: u32, is_valid: bool) {
        if self
            .phase
            .wait_for(Phase::Building, self.config.phase_wait_timeout, self.config.phase_poll_interval)
            .await
            .is_err()
        {
            return;
        }

        // Phase alone doesn't close the race: `run_interval_validation`'s
        // reset of `validation_votes`/`validation_responses` happens
        // partway through `construct_block`, after the BUILDING
        // transition, not at it. A peer that reaches BUILDING first can
        // have its vote land here before our own reset runs, only to have
        // it wiped out a moment later. Wait for `validation_expected` too
        // — it is only set once our own reset has happened.
        let deadline = tokio::time::Instant::now() + self.config.phase_wait_timeout;
        loop {
            if self.round.lock().await.validation_expected.is_some() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                debug!("dropping interval validation vote: local validation round never started");
                return;
            }
            tokio::time::sleep(self.config.phase_poll_interval).await;
        }

        self.record_interval_vote(interval_idx, is_valid).await;
    }

    async fn send_sig_of_block_hash(self: &Arc<Self>, block: &Block) -> Result<(), ConsensusError> {
        let hash = block_hash(block, 0);
        let signature = sign_hash(&hash, &self.signing_key);
        let sig = BlockSignature { signer: self.config.address.clone(), block_hash: hash, signature };

        let quorum = self.current_quorum().await;
        for peer in quorum.iter().filter(|a| **a != self.config.address) {
            let _ = self.transport.send_one_way(peer, Message::ReceiveSignature(sig.clone())).await;
        }

        // Same degenerate-quorum reasoning as `send_quorum_ready`: with no
        // other members to send to, `quorum_sigs` never grows via
        // `handle_receive_signature`'s threshold check, so a singleton
        // quorum (spec §8 boundary "QUORUM_SIZE = 1") would never reach
        // `tally_quorum_sigs` without this check.
        let threshold_already_met = {
            let round = self.round.lock().await;
            round.quorum_sigs.len() >= quorum.len().saturating_sub(1)
        };
        if threshold_already_met {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = this.tally_quorum_sigs().await {
                    warn!(error = %e, "tally_quorum_sigs failed");
                }
            });
        }
        Ok(())
    }

    // ---- §4.4.7 receive_quorum_signature (gated on BUILDING) ----
    pub async fn handle_receive_signature(self: &Arc<Self>, sig: BlockSignature) {
        if self
            .phase
            .wait_for(Phase::Building, self.config.phase_wait_timeout, self.config.phase_poll_interval)
            .await
            .is_err()
        {
            return;
        }

        let quorum = self.current_quorum().await;
        if !self.in_quorum().await || !quorum.contains(&sig.signer) {
            debug!(signer = %sig.signer, "dropping signature from non-quorum signer or while not in quorum");
            return;
        }

        let reached = {
            let mut round = self.round.lock().await;
            round.quorum_sigs.push(sig);
            sequencer_metrics::record_quorum_sigs_collected(round.quorum_sigs.len());
            round.quorum_sigs.len() >= quorum.len().saturating_sub(1)
        };
        if reached {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = this.tally_quorum_sigs().await {
                    warn!(error = %e, "tally_quorum_sigs failed");
                }
            });
        }
    }

    // ---- §4.4.8 tally_quorum_sigs (BUILDING -> COMMITTING) ----
    pub async fn tally_quorum_sigs(self: &Arc<Self>) -> Result<(), ConsensusError> {
        self.phase.set(Phase::Committing).await;

        let quorum = self.current_quorum().await;
        let (quorum_block, quorum_sigs) = {
            let mut round = self.round.lock().await;
            let block = round
                .quorum_block
                .clone()
                .ok_or_else(|| ConsensusError::RoundAborted("no candidate block".into()))?;
            let sigs = std::mem::take(&mut round.quorum_sigs);
            (block, sigs)
        };

        self.mempool.lock().await.clear();

        let local_hash = block_hash(&quorum_block, 0);
        // Vec, not HashMap: preserves first-seen order, which
        // `select_winning_hash` relies on to make ties favor the
        // first-seen hash (spec §4.4.8 step 4) — starting the vote with
        // the local candidate means a tie always favors it.
        let mut votes: Vec<(String, u32)> = vec![(local_hash.clone(), 1)];

        for sig in &quorum_sigs {
            if !verify_signature(&sig.block_hash, &sig.signature, &sig.signer, &self.registry) {
                continue;
            }
            match votes.iter_mut().find(|(hash, _)| *hash == sig.block_hash) {
                Some((_, count)) => *count += 1,
                None => {
                    // Spec §9 open question #1: the source inserts a
                    // first-seen non-local hash with vote count 0,
                    // under-counting its first signer. Preserved behind
                    // `preserve_source_tally_quirk`.
                    let initial = if self.config.preserve_source_tally_quirk { 0 } else { 1 };
                    votes.push((sig.block_hash.clone(), initial));
                }
            }
        }

        let winning = select_winning_hash(votes);

        let outcome = match winning {
            Some((hash, count)) if hash == local_hash && count as usize == quorum.len() => {
                let skeleton = skeleton::build_skeleton(&quorum_block, quorum_sigs);
                self.broadcast_skeleton(&skeleton).await;
                self.add_block(quorum_block).await
            }
            Some((hash, count)) => {
                sequencer_metrics::record_round_aborted();
                warn!(
                    winning_hash = %hash,
                    votes = count,
                    quorum = quorum.len(),
                    "round aborted: tally did not settle on the local candidate block"
                );
                Err(ConsensusError::RoundAborted(format!(
                    "winning hash {hash} got {count}/{} votes",
                    quorum.len()
                )))
            }
            None => {
                sequencer_metrics::record_round_aborted();
                Err(ConsensusError::RoundAborted("no votes recorded".into()))
            }
        };

        {
            let mut round = self.round.lock().await;
            if let Some(started_at) = round.started_at.take() {
                sequencer_metrics::record_consensus_round_duration_ms(
                    started_at.elapsed().as_secs_f64() * 1000.0,
                );
            }
            round.reset();
        }
        if outcome.is_err() {
            self.phase.set(Phase::Idle).await;
        }
        outcome
    }

    // ---- §4.7 add_block (final commit step for both the quorum and
    // skeleton paths) ----
    pub async fn add_block(self: &Arc<Self>, mut block: Block) -> Result<(), ConsensusError> {
        self.phase.set(Phase::Idle).await;

        let digests = block.ordered_tx_digests();
        block.merkle_root = Some(merkle_root(&digests));

        let financial_txs: Vec<FinancialTx> = if self.config.flavor == Flavor::Financial {
            block.tx_map.values().filter_map(|tx| tx.as_financial().cloned()).collect()
        } else {
            Vec::new()
        };

        {
            let mut storage = self.storage.lock().await;
            storage.append_block(block.clone())?;

            // Net deltas, not a per-transfer `apply_transfer` replay: the
            // block's transactions came out of a `HashMap` (unspecified
            // iteration order), and a dependent chain within one block
            // (A funds B, B spends what it just received) can fail the
            // interim balance check purely because of that order even
            // though `construct_block`'s fixed-point pass already proved
            // the whole set settles. Summed deltas are order-independent.
            let mut deltas: HashMap<types::AccountKey, i128> = HashMap::new();
            for tx in &financial_txs {
                *deltas.entry(tx.from.clone()).or_insert(0) -= tx.amount as i128;
                *deltas.entry(tx.to.clone()).or_insert(0) += tx.amount as i128;
            }
            for (account, delta) in deltas {
                let updated = storage.balance(&account) as i128 + delta;
                storage.set_balance(account, updated.max(0) as u64);
            }
        }

        if !financial_txs.is_empty() {
            let subscriptions = self.wallet_subscriptions.read().await.clone();
            let local_peers = self.local_peers.read().await.clone();
            for tx in &financial_txs {
                if !(subscriptions.contains(&tx.from) || subscriptions.contains(&tx.to)) {
                    continue;
                }
                let Some(idx) = digests.iter().position(|d| *d == tx.uid.digest()) else {
                    continue;
                };
                let Some(proof) = merkle_proof(&digests, idx) else {
                    continue;
                };
                let proof_json = serde_json::to_string(&proof).unwrap_or_default();
                for peer in &local_peers {
                    let _ = self
                        .transport
                        .send_one_way(
                            peer,
                            Message::AlertWallet {
                                account: tx.from.to_string(),
                                proof_json: proof_json.clone(),
                            },
                        )
                        .await;
                }
            }
        }

        self.round.lock().await.reset();

        if self.in_quorum().await {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.maybe_start_round().await;
            });
        }
        Ok(())
    }

    // ---- §4.6 Skeleton Propagator ----
    async fn broadcast_skeleton(self: &Arc<Self>, skeleton: &types::BlockSkeleton) {
        let peers = self.local_peers.read().await.clone();
        for peer in peers.iter().filter(|a| **a != self.config.address) {
            let _ = self.transport.send_one_way(peer, Message::ReceiveSkeleton(skeleton.clone())).await;
        }
    }

    /// Dispatch target for an inbound `RECEIVE_SKELETON` one-way message
    /// (gated on IDLE, spec §4.6.2).
    pub async fn handle_receive_skeleton(self: &Arc<Self>, skel: types::BlockSkeleton) {
        if self
            .phase
            .wait_for(Phase::Idle, self.config.phase_wait_timeout, self.config.phase_poll_interval)
            .await
            .is_err()
        {
            return;
        }

        let tip = self.tip().await;
        if skel.block_id != tip.block_id + 1 {
            // Covers both idempotence (already at or past this height) and
            // out-of-order arrival (spec §8 invariant 5).
            debug!(incoming = skel.block_id, tip = tip.block_id, "dropping skeleton: not the tip successor");
            return;
        }

        let quorum = quorum::derive_quorum(&tip, 0, &self.config.global_peers, self.config.quorum_member_count());
        let verified_count = skel
            .signatures
            .iter()
            .filter(|sig| quorum.contains(&sig.signer))
            .filter(|sig| verify_signature(&sig.block_hash, &sig.signature, &sig.signer, &self.registry))
            .count();

        let required = quorum.len().saturating_sub(SKELETON_SIGNATURE_SLACK);
        if verified_count != required {
            debug!(verified_count, required, "rejecting skeleton: signature count does not match quorum policy");
            return;
        }

        let block = match self.reconstruct_block(&skel).await {
            Ok(block) => block,
            Err(e) => {
                warn!(error = %e, "skeleton reconstruction failed");
                return;
            }
        };

        if let Err(e) = self.add_block(block).await {
            warn!(error = %e, "failed to append reconstructed block");
            return;
        }

        let peers = self.local_peers.read().await.clone();
        for peer in peers.iter().filter(|a| **a != self.config.address) {
            let _ = self.transport.send_one_way(peer, Message::ReceiveSkeleton(skel.clone())).await;
        }
    }

    /// Spec §9 open question #2, resolved as a REDESIGN: rather than
    /// silently dropping transactions missing from the local mempool (the
    /// source's behavior), wait bounded for them to arrive via gossip and
    /// fail loudly if they never do. The reconstructed hash is re-verified
    /// against the skeleton's — the source never does this.
    async fn reconstruct_block(self: &Arc<Self>, skel: &types::BlockSkeleton) -> Result<Block, ConsensusError> {
        let deadline = tokio::time::Instant::now() + self.config.skeleton_reconstruction_timeout;
        let mut found_txs: Vec<Transaction> = Vec::new();
        let mut remaining = skel.tx_digests.clone();

        loop {
            let (found, missing) = { self.mempool.lock().await.drain(&remaining) };
            found_txs.extend(found);
            remaining = missing;
            if remaining.is_empty() || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.config.phase_poll_interval).await;
        }

        if !remaining.is_empty() {
            return Err(ConsensusError::SkeletonReconstruction {
                block_id: skel.block_id,
                reason: format!("{} transaction(s) never arrived via gossip", remaining.len()),
            });
        }

        let mut tx_map = HashMap::new();
        for tx in found_txs {
            tx_map.insert(tx.digest(), tx);
        }

        let tip = self.tip().await;
        let block = Block {
            block_id: skel.block_id,
            prev_hash: block_hash(&tip, 0),
            tx_map,
            merkle_root: None,
            ml: if self.config.flavor == Flavor::Ml {
                Some(MlBlockExt {
                    interval_validations: skel.interval_validations.clone(),
                    all_valid: skel.all_valid,
                })
            } else {
                None
            },
        };

        let computed_hash = block_hash(&block, 0);
        if computed_hash != skel.block_hash {
            return Err(ConsensusError::SkeletonReconstruction {
                block_id: skel.block_id,
                reason: format!(
                    "reconstructed hash {computed_hash} does not match skeleton hash {}",
                    skel.block_hash
                ),
            });
        }

        Ok(block)
    }

    // ---- §4.4.5 transaction acceptance ----

    /// Entry point for both RPC-submitted transactions and gossiped
    /// `ADD_TRANSACTION` messages — both go through the same gated
    /// acceptance path.
    pub async fn submit_tx(self: &Arc<Self>, tx: Transaction) {
        self.handle_add_transaction(tx).await
    }

    pub async fn handle_add_transaction(self: &Arc<Self>, tx: Transaction) {
        if self
            .phase
            .wait_for(Phase::Idle, self.config.phase_wait_timeout, self.config.phase_poll_interval)
            .await
            .is_err()
        {
            return;
        }

        let digest = tx.digest();
        if self.mempool.lock().await.contains(&digest) {
            return;
        }

        let storage = self.storage.lock().await;
        if storage.contains_digest(&digest) {
            return;
        }

        let pending: Vec<Transaction> = {
            let mempool = self.mempool.lock().await;
            mempool.snapshot_keys().into_iter().filter_map(|d| mempool.get(&d).cloned()).collect()
        };

        if let Err(e) = self.validator.validate(&tx, &pending, &*storage) {
            debug!(error = %e, "rejecting transaction at admission");
            return;
        }
        let committed = storage.committed_digests();
        drop(storage);

        let outcome = self.mempool.lock().await.insert(tx.clone(), &committed);

        match outcome {
            Ok(InsertOutcome::Inserted) => {
                sequencer_metrics::record_tx_submitted();
                let peers = self.local_peers.read().await.clone();
                for peer in &peers {
                    let _ = self.transport.send_one_way(peer, Message::AddTransaction(tx.clone())).await;
                }
                if self.current_phase().await == Phase::Idle {
                    let this = Arc::clone(self);
                    tokio::spawn(async move {
                        this.maybe_start_round().await;
                    });
                }
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "mempool insert failed"),
        }
    }

    /// Dispatch glue: routes an inbound `Message` (from the networking
    /// layer) to the matching handler, returning the reply for two-way
    /// exchanges (`None` for one-way messages or replies that need no
    /// further action from this side).
    pub async fn dispatch(self: &Arc<Self>, msg: Message) -> Option<Message> {
        match msg {
            Message::Ping => Some(Message::Ping),
            Message::QuorumReady => self.handle_quorum_ready_request().await,
            Message::ReconcileBlockFull { .. } | Message::ReconcileBlockId { .. } => None,
            Message::ReceiveMempoolRequest { digests } => {
                self.handle_receive_mempool_request(digests).await
            }
            Message::ReceiveMempoolReply { txs } => {
                self.handle_receive_mempool_reply(txs).await;
                None
            }
            Message::RequestTransaction { .. } => None,
            Message::ReceiveSignature(sig) => {
                self.handle_receive_signature(sig).await;
                None
            }
            Message::ReceiveSkeleton(skel) => {
                self.handle_receive_skeleton(skel).await;
                None
            }
            Message::ReceiveIntervalValidation { interval_idx, is_valid } => {
                self.handle_receive_interval_validation(interval_idx, is_valid).await;
                None
            }
            Message::AddTransaction(tx) => {
                self.handle_add_transaction(tx).await;
                None
            }
            Message::AlertWallet { .. } => None,
        }
    }
}
