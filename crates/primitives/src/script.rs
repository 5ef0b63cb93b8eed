//! The two standard output script forms the node produces and recognizes,
//! plus the legacy sig-op counter used by the block size rules.

pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

pub const PUBKEY_HASH_LEN: usize = 20;

/// OP_DUP OP_HASH160 <20 bytes> OP_EQUALVERIFY OP_CHECKSIG
pub fn p2pkh_script(pubkey_hash: &[u8; PUBKEY_HASH_LEN]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.push(OP_DUP);
    script.push(OP_HASH160);
    script.push(PUBKEY_HASH_LEN as u8);
    script.extend_from_slice(pubkey_hash);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

/// <push pubkey> OP_CHECKSIG
pub fn p2pk_script(pubkey: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(pubkey.len() + 2);
    script.push(pubkey.len() as u8);
    script.extend_from_slice(pubkey);
    script.push(OP_CHECKSIG);
    script
}

pub fn is_pay_to_pubkey_hash(script: &[u8]) -> bool {
    script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == PUBKEY_HASH_LEN as u8
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
}

pub fn is_pay_to_pubkey(script: &[u8]) -> bool {
    extract_pubkey(script).is_some()
}

pub fn extract_pubkey_hash(script: &[u8]) -> Option<[u8; PUBKEY_HASH_LEN]> {
    if !is_pay_to_pubkey_hash(script) {
        return None;
    }
    let mut hash = [0u8; PUBKEY_HASH_LEN];
    hash.copy_from_slice(&script[3..23]);
    Some(hash)
}

/// Raw pubkey bytes from a pay-to-pubkey script. Accepts the compressed and
/// uncompressed encodings.
pub fn extract_pubkey(script: &[u8]) -> Option<&[u8]> {
    let push = *script.first()? as usize;
    if (push != 33 && push != 65) || script.len() != push + 2 {
        return None;
    }
    if script[push + 1] != OP_CHECKSIG {
        return None;
    }
    Some(&script[1..=push])
}

/// Legacy static sig-op count: CHECKSIG counts one, CHECKMULTISIG counts
/// twenty. Walks pushes so data bytes are never misread as opcodes, and stops
/// at a truncated push like the original counter does.
pub fn sig_op_count(script: &[u8]) -> usize {
    let mut ops = 0usize;
    let mut i = 0usize;
    while i < script.len() {
        let opcode = script[i];
        i += 1;
        let data_len = match opcode {
            len @ 0x01..=0x4b => len as usize,
            OP_PUSHDATA1 => {
                let Some(&len) = script.get(i) else { break };
                i += 1;
                len as usize
            }
            OP_PUSHDATA2 => {
                let Some(bytes) = script.get(i..i + 2) else {
                    break;
                };
                i += 2;
                u16::from_le_bytes([bytes[0], bytes[1]]) as usize
            }
            OP_PUSHDATA4 => {
                let Some(bytes) = script.get(i..i + 4) else {
                    break;
                };
                i += 4;
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
            }
            OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                ops += 1;
                0
            }
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                ops += 20;
                0
            }
            _ => 0,
        };
        if data_len > script.len() - i {
            break;
        }
        i += data_len;
    }
    ops
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p2pkh_round_trip() {
        let hash = [0x5a; 20];
        let script = p2pkh_script(&hash);
        assert!(is_pay_to_pubkey_hash(&script));
        assert_eq!(extract_pubkey_hash(&script), Some(hash));
        assert_eq!(sig_op_count(&script), 1);
    }

    #[test]
    fn p2pk_round_trip() {
        let pubkey = [0x02; 33];
        let script = p2pk_script(&pubkey);
        assert!(is_pay_to_pubkey(&script));
        assert_eq!(extract_pubkey(&script), Some(&pubkey[..]));
        assert!(!is_pay_to_pubkey_hash(&script));
    }

    #[test]
    fn multisig_counts_twenty() {
        assert_eq!(sig_op_count(&[OP_CHECKMULTISIG]), 20);
    }

    #[test]
    fn truncated_push_does_not_panic() {
        // Claims a 32-byte push but ends after two.
        assert_eq!(sig_op_count(&[0x20, 0xaa, 0xbb]), 0);
        assert_eq!(sig_op_count(&[OP_PUSHDATA2, 0xff]), 0);
    }

    #[test]
    fn pubkey_hash_data_is_not_an_opcode() {
        // The 20 pushed bytes contain 0xac which must not count as CHECKSIG.
        let mut hash = [0u8; 20];
        hash[4] = OP_CHECKSIG;
        let script = p2pkh_script(&hash);
        assert_eq!(sig_op_count(&script), 1);
    }
}
