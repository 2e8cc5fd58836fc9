use std::collections::HashMap;

use bitcoin::{Address, Amount, Network, Transaction};

/// Amount received per address in `tx`.
///
/// Outputs whose script is not a standard address (OP_RETURN, bare multisig, ...)
/// are skipped. Several outputs to one address are summed.
pub fn tx_outputs(tx: &Transaction, network: Network) -> HashMap<String, Amount> {
    let mut received: HashMap<String, Amount> = HashMap::new();
    for out in &tx.output {
        let Ok(addr) = Address::from_script(&out.script_pubkey, network) else {
            continue;
        };
        let total = received.entry(addr.to_string()).or_insert(Amount::ZERO);
        *total = total.checked_add(out.value).unwrap_or(Amount::MAX);
    }
    received
}
