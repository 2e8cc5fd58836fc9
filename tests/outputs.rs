mod common;

use bitcoin::{Amount, ScriptBuf};
use common::*;
use niebla_watch::tx_outputs;

#[test]
fn outputs_to_one_address_are_summed() {
    let (a, script_a) = address(1);
    let (b, script_b) = address(2);
    let tx = payment(9, &[(&script_a, 1_000), (&script_b, 20), (&script_a, 500)]);

    let received = tx_outputs(&tx, NETWORK);

    assert_eq!(received.len(), 2);
    assert_eq!(received[&a], Amount::from_sat(1_500));
    assert_eq!(received[&b], Amount::from_sat(20));
}

#[test]
fn non_address_outputs_are_skipped() {
    let (a, script_a) = address(3);
    // OP_RETURN <0xdead>
    let op_return = ScriptBuf::from_bytes(vec![0x6a, 0x02, 0xde, 0xad]);
    let tx = payment(9, &[(&op_return, 0), (&script_a, 7)]);

    let received = tx_outputs(&tx, NETWORK);

    assert_eq!(received.len(), 1);
    assert_eq!(received[&a], Amount::from_sat(7));
}

#[test]
fn empty_transaction_yields_empty_map() {
    let tx = payment(9, &[]);
    assert!(tx_outputs(&tx, NETWORK).is_empty());
}
