//! Integration tests for the transaction engine
//!
//! Drives the Planner directly against the simulated rank and checks the
//! wire-level contract: color parity, FIFO order, idle-slice sentinels,
//! the retry bound and abort semantics.

use pim_driver::backends::SIMULATED_CHIP_ID;
use pim_driver::{
    execute_transaction, BackendStatus, BackendType, ColorClass, PimError, QueryKind, RankBackend,
    RankConfig, RankRuntimeState, SimulatedRank, SliceTarget, Target, Topology, Transaction,
    TransferDescriptor,
};
use pim_ufi::wire::{self, Opcode, DEBUGGER_VALIDATED, EMPTY};
use pim_ufi::DpuId;
use proptest::prelude::*;

const RETRIES: u32 = 100;

fn setup(slices: u8, dpus: u8) -> (RankRuntimeState, SimulatedRank) {
    let config = RankConfig::new(Topology::new(slices, dpus));
    (RankRuntimeState::new(&config), SimulatedRank::for_config(&config))
}

fn opcodes_of(sim: &SimulatedRank, slice: usize) -> Vec<u8> {
    sim.committed()
        .iter()
        .map(|packet| wire::top_byte(packet[slice]))
        .collect()
}

/// Color equals the parity of addressed commands sent to the slice
#[test]
fn test_color_parity_follows_addressed_commands() {
    let (mut state, mut sim) = setup(2, 4);
    let mut txn = Transaction::new(2);
    txn.push(Target::All(0), QueryKind::Identity).expect("queue");
    txn.push(Target::Previous(0), QueryKind::Nop).expect("queue");
    txn.push(Target::Previous(0), QueryKind::ReadRun).expect("queue");
    txn.push(Target::Dpu(DpuId::new(0, 2)), QueryKind::ReadFault).expect("queue");
    txn.push(Target::Previous(0), QueryKind::Nop).expect("queue");
    txn.push(Target::All(1), QueryKind::ReadRun).expect("queue");

    execute_transaction(&mut state, &mut sim, RETRIES, &mut txn).expect("execute");

    for slice in 0..2u8 {
        let addressed = sim
            .committed()
            .iter()
            .filter(|packet| wire::addresses_slice(packet[usize::from(slice)]))
            .count();
        let expected = addressed % 2 == 1;
        assert_eq!(state.slices[usize::from(slice)].color, expected, "slice {slice}");
        assert_eq!(sim.color(slice), Some(expected), "simulated slice {slice}");
    }
    // SelectAll, Identity, ReadRun, SelectDpu, ReadFault
    assert!(state.slices[0].color);
}

/// Tail-added queries hit the wire and complete in submission order
#[test]
fn test_fifo_order() {
    let (mut state, mut sim) = setup(2, 4);
    let mut txn = Transaction::new(2);
    let q1 = txn.push(Target::All(1), QueryKind::Identity).expect("queue");
    let q2 = txn.push(Target::Previous(1), QueryKind::ReadRun).expect("queue");
    let q3 = txn.push(Target::Previous(1), QueryKind::ReadFault).expect("queue");

    execute_transaction(&mut state, &mut sim, RETRIES, &mut txn).expect("execute");

    assert_eq!(
        opcodes_of(&sim, 1),
        vec![
            Opcode::SelectAll as u8,
            Opcode::Identity as u8,
            Opcode::ReadRun as u8,
            Opcode::ReadFault as u8
        ]
    );
    assert_eq!(txn.result(q1).and_then(|r| r.as_u32()), Some(SIMULATED_CHIP_ID));
    assert_eq!(txn.result(q2).and_then(|r| r.as_u8()), Some(0));
    assert_eq!(txn.result(q3).and_then(|r| r.as_u8()), Some(0));
}

/// A slice with nothing queued sends EMPTY in every packet
#[test]
fn test_idle_slice_sends_empty_sentinel() {
    let (mut state, mut sim) = setup(2, 4);
    state.slices[0].slice_target = Some(SliceTarget::All);

    let mut txn = Transaction::new(2);
    txn.push(Target::Previous(0), QueryKind::ReadRun).expect("queue");
    txn.push(Target::Previous(0), QueryKind::Nop).expect("queue");
    txn.push(Target::Previous(0), QueryKind::ReadFault).expect("queue");

    let report = execute_transaction(&mut state, &mut sim, RETRIES, &mut txn).expect("execute");

    assert_eq!(report.packets, 3);
    let packets = sim.committed();
    assert_eq!(packets.len(), 3);
    assert!(packets.iter().all(|p| p[1] == EMPTY));
    assert!(!state.slices[1].color);
}

/// A slice that never answers times out after exactly the retry budget
#[test]
fn test_retry_bound_is_exact() {
    let (mut state, mut sim) = setup(2, 4);
    sim.set_stuck_slice(Some(0));

    let mut txn = Transaction::new(2);
    txn.push(Target::All(0), QueryKind::Identity).expect("queue");
    txn.push(Target::All(1), QueryKind::Identity).expect("queue");

    let err = execute_transaction(&mut state, &mut sim, RETRIES, &mut txn).unwrap_err();
    assert!(matches!(err, PimError::Timeout { attempts: 100 }));
    assert_eq!(sim.update_count(), 100);
    assert_eq!(sim.commit_count(), 1);

    // queued work is dropped, shadows of the failing step forgotten
    assert!(txn.is_empty());
    assert_eq!(state.slices[0].slice_target, None);
    assert_eq!(state.slices[1].slice_target, None);
}

/// Stale responses are retried, then one final read is taken
#[test]
fn test_unsettled_reads_are_retried() {
    let (mut state, mut sim) = setup(2, 2);
    sim.set_unsettled_reads(3);

    let mut txn = Transaction::new(2);
    let id = txn.push(Target::All(0), QueryKind::Identity).expect("queue");
    let report = execute_transaction(&mut state, &mut sim, RETRIES, &mut txn).expect("execute");

    assert_eq!(report.packets, 2);
    // 3 stale + 1 valid + 1 final per packet
    assert_eq!(report.read_backs, 10);
    assert_eq!(sim.update_count(), 10);
    assert_eq!(txn.result(id).and_then(|r| r.as_u32()), Some(SIMULATED_CHIP_ID));
}

/// Decode errors and collisions are recorded, not raised
#[test]
fn test_color_faults_are_recorded() {
    let (mut state, mut sim) = setup(2, 2);
    sim.inject_color_fault(0, ColorClass::Decode);
    sim.inject_color_fault(1, ColorClass::DecodeCollide);

    let mut txn = Transaction::new(2);
    txn.push(Target::All(0), QueryKind::ReadRun).expect("queue");
    txn.push(Target::All(1), QueryKind::ReadRun).expect("queue");
    execute_transaction(&mut state, &mut sim, RETRIES, &mut txn).expect("execute");

    assert!(state.slices[0].fault_decode);
    assert!(!state.slices[0].fault_collide);
    assert!(state.slices[1].fault_decode);
    assert!(state.slices[1].fault_collide);
    assert_eq!(state.slices_with_protocol_faults(), vec![0, 1]);
}

/// A backend failure aborts the transaction; the next one starts clean
#[test]
fn test_driver_error_aborts_transaction() {
    let (mut state, mut sim) = setup(2, 2);
    sim.fail_next_commit(BackendStatus::CommunicationError);

    let mut txn = Transaction::new(2);
    txn.push(Target::All(0), QueryKind::Identity).expect("queue");
    txn.push(Target::Previous(0), QueryKind::ReadRun).expect("queue");
    let err = execute_transaction(&mut state, &mut sim, RETRIES, &mut txn).unwrap_err();
    assert!(matches!(err, PimError::Driver { .. }));
    assert!(txn.is_empty());
    assert_eq!(sim.commit_count(), 0);
    assert_eq!(Some(state.slices[0].color), sim.color(0));

    let mut txn = Transaction::new(2);
    let id = txn.push(Target::All(0), QueryKind::Identity).expect("queue");
    execute_transaction(&mut state, &mut sim, RETRIES, &mut txn).expect("execute");
    assert!(txn.result(id).is_some());
}

/// A packet rejected while it is built leaves every slice color alone
#[test]
fn test_build_error_keeps_colors_in_step() {
    let (mut state, mut sim) = setup(2, 4);

    let mut txn = Transaction::new(2);
    txn.push(Target::All(0), QueryKind::ReadRun).expect("queue");
    txn.push(Target::Previous(1), QueryKind::ReadRun).expect("queue");
    let err = execute_transaction(&mut state, &mut sim, RETRIES, &mut txn).unwrap_err();
    assert!(matches!(err, PimError::Internal { .. }));
    assert_eq!(sim.commit_count(), 0);
    assert!(!state.slices[0].color);
    assert_eq!(sim.color(0), Some(false));
    assert_eq!(state.slices[0].slice_target, None);

    let mut txn = Transaction::new(2);
    let id = txn.push(Target::All(0), QueryKind::Identity).expect("queue");
    execute_transaction(&mut state, &mut sim, RETRIES, &mut txn).expect("execute");
    assert!(txn.result(id).is_some());
    assert_eq!(Some(state.slices[0].color), sim.color(0));
}

/// Members outside the slice are rejected before anything is committed
#[test]
fn test_member_outside_slice_is_internal() {
    let (mut state, mut sim) = setup(1, 4);

    for member in [4, 9] {
        let mut txn = Transaction::new(1);
        txn.push(
            Target::Dpu(DpuId::new(0, member)),
            QueryKind::WramWrite {
                address: 0,
                words: vec![1],
            },
        )
        .expect("queue");
        let err = execute_transaction(&mut state, &mut sim, RETRIES, &mut txn).unwrap_err();
        assert!(matches!(err, PimError::Internal { .. }), "member {member}: {err:?}");
        assert!(txn.is_empty());
    }
    assert_eq!(sim.commit_count(), 0);
    assert_eq!(Some(state.slices[0].color), sim.color(0));

    let mut txn = Transaction::new(1);
    txn.push(Target::Dpu(DpuId::new(0, 9)), QueryKind::ReadRun).expect("queue");
    assert!(execute_transaction(&mut state, &mut sim, RETRIES, &mut txn).is_err());
    assert_eq!(sim.commit_count(), 0);
}

/// A selection already latched on the slice is not sent again
#[test]
fn test_repeated_selection_is_elided() {
    let (mut state, mut sim) = setup(1, 4);
    let dpu = Target::Dpu(DpuId::new(0, 1));

    let mut txn = Transaction::new(1);
    txn.push(dpu, QueryKind::ReadRun).expect("queue");
    txn.push(dpu, QueryKind::ReadFault).expect("queue");
    txn.push(
        dpu,
        QueryKind::WramWrite {
            address: 4,
            words: vec![1],
        },
    )
    .expect("queue");
    txn.push(
        dpu,
        QueryKind::WramWrite {
            address: 4,
            words: vec![2],
        },
    )
    .expect("queue");
    execute_transaction(&mut state, &mut sim, RETRIES, &mut txn).expect("execute");

    assert_eq!(
        opcodes_of(&sim, 0),
        vec![
            Opcode::SelectDpu as u8,
            Opcode::ReadRun as u8,
            Opcode::ReadFault as u8,
            Opcode::WriteStructure as u8,
            Opcode::WramWrite as u8,
            Opcode::WramWrite as u8
        ]
    );
    assert_eq!(sim.wram(DpuId::new(0, 1), 4, 1), vec![2]);
}

/// `Previous` with nothing selected is an invariant violation
#[test]
fn test_previous_without_selection_is_internal() {
    let (mut state, mut sim) = setup(2, 2);
    let mut txn = Transaction::new(2);
    txn.push(Target::Previous(1), QueryKind::ReadRun).expect("queue");
    let err = execute_transaction(&mut state, &mut sim, RETRIES, &mut txn).unwrap_err();
    assert!(matches!(err, PimError::Internal { .. }));
    assert_eq!(sim.commit_count(), 0);
}

/// Backend whose every response has been overridden by a debugger
#[derive(Debug, Default)]
struct DebuggerBackend {
    updates: u32,
}

impl RankBackend for DebuggerBackend {
    fn commit_commands(&mut self, _commands: &[u64]) -> BackendStatus {
        BackendStatus::Success
    }

    fn update_commands(&mut self, results: &mut [u64]) -> BackendStatus {
        self.updates += 1;
        results.fill(DEBUGGER_VALIDATED);
        BackendStatus::Success
    }

    fn copy_to_rank(&mut self, _xfer: &TransferDescriptor) -> BackendStatus {
        BackendStatus::InvalidProperty
    }

    fn copy_from_rank(&mut self, _xfer: &mut TransferDescriptor) -> BackendStatus {
        BackendStatus::InvalidProperty
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Hardware
    }
}

/// The debugger-validated word is accepted without color checking
#[test]
fn test_debugger_validated_word_is_accepted() {
    let config = RankConfig::new(Topology::new(2, 2));
    let mut state = RankRuntimeState::new(&config);
    let mut backend = DebuggerBackend::default();

    let mut txn = Transaction::new(2);
    txn.push(Target::All(0), QueryKind::ReadRun).expect("queue");
    let report = execute_transaction(&mut state, &mut backend, RETRIES, &mut txn).expect("execute");

    assert_eq!(report.packets, 2);
    assert_eq!(backend.updates, 4);
    assert!(state.slices_with_protocol_faults().is_empty());
}

/// Lane discovery waits in its own phase
#[test]
fn test_byte_order_phase() {
    let (mut state, mut sim) = setup(2, 2);
    sim.set_byte_order_delay(7);

    let mut txn = Transaction::new(2);
    let a = txn.push(Target::All(0), QueryKind::ByteOrder).expect("queue");
    let b = txn.push(Target::All(1), QueryKind::ByteOrder).expect("queue");
    let report = execute_transaction(&mut state, &mut sim, RETRIES, &mut txn).expect("execute");

    // 7 unsettled + 1 settled, then the final read
    assert_eq!(report.read_backs, 9);
    for id in [a, b] {
        assert_eq!(
            txn.result(id).and_then(|r| r.as_u64()),
            Some(wire::BYTE_ORDER_SIGNATURE)
        );
    }
}

fn kind_for(code: u8) -> (bool, QueryKind) {
    match code % 5 {
        0 => (false, QueryKind::Nop),
        1 => (true, QueryKind::ReadRun),
        2 => (true, QueryKind::ReadFault),
        3 => (true, QueryKind::Identity),
        _ => (false, QueryKind::ByteOrder),
    }
}

// Property-based color tracking
proptest! {
    /// Host and slice colors agree after any mix of queries
    #[test]
    fn prop_host_color_tracks_slice(
        codes in prop::collection::vec((0u8..3, 0u8..10, 0u8..4), 1..40),
    ) {
        let (mut state, mut sim) = setup(3, 4);
        let mut txn = Transaction::new(3);
        for (slice, code, member) in codes {
            let (selects, kind) = kind_for(code);
            let target = if selects && code >= 5 {
                Target::Dpu(DpuId::new(slice, member))
            } else if selects {
                Target::All(slice)
            } else {
                Target::Previous(slice)
            };
            txn.push(target, kind).expect("queue");
        }
        execute_transaction(&mut state, &mut sim, RETRIES, &mut txn).expect("execute");

        for slice in 0..3u8 {
            let addressed = sim
                .committed()
                .iter()
                .filter(|packet| wire::addresses_slice(packet[usize::from(slice)]))
                .count();
            prop_assert_eq!(state.slices[usize::from(slice)].color, addressed % 2 == 1);
            prop_assert_eq!(sim.color(slice), Some(addressed % 2 == 1));
        }
        prop_assert!(txn.is_empty());
    }
}
