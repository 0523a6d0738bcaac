//! Pay-to-Public-Key-Hash scripts
//!
//! A small stack machine for the Bitcoin-compatible subset needed to lock a
//! shard to its owner:
//!
//! ```text
//! locking:   OP_DUP OP_HASH160 <pkh-20> OP_EQUALVERIFY OP_CHECKSIG
//! unlocking: <signature> <public key>
//! ```
//!
//! Delete authorization runs the same locking script in [`CheckMode::KeyHash`]
//! against a virtual unlocking script holding only the requester's key hash.

use crate::crypto::{self, PUB_KEY_HASH_SIZE};
use crate::error::{DefsError, Result};

pub mod opcode {
    pub const OP_0: u8 = 0x00;
    /// Largest direct push length
    pub const OP_PUSHBYTES_75: u8 = 0x4b;
    pub const OP_VERIFY: u8 = 0x69;
    pub const OP_DUP: u8 = 0x76;
    pub const OP_EQUAL: u8 = 0x87;
    pub const OP_EQUALVERIFY: u8 = 0x88;
    pub const OP_HASH160: u8 = 0xa9;
    pub const OP_CHECKSIG: u8 = 0xac;
}

use opcode::*;

/// Length of a standard P2PKH locking script
pub const P2PKH_SCRIPT_LEN: usize = 25;

/// How `OP_CHECKSIG` (and `OP_HASH160` on pre-hashed input) behave
#[derive(Debug, Clone)]
pub enum CheckMode<'a> {
    /// Full verification: `OP_CHECKSIG` checks an ECDSA signature over `message`
    Signature { message: &'a [u8] },
    /// Key-hash authorization: the stack starts from a public-key hash, so
    /// `OP_HASH160` passes 20-byte items through and `OP_CHECKSIG` accepts
    KeyHash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Op {
    Push(Vec<u8>),
    Code(u8),
}

fn reject(reason: impl Into<String>) -> DefsError {
    DefsError::ScriptRejected(reason.into())
}

fn parse(script: &[u8]) -> Result<Vec<Op>> {
    let mut ops = Vec::new();
    let mut pos = 0;
    while pos < script.len() {
        let byte = script[pos];
        pos += 1;
        match byte {
            OP_0 => ops.push(Op::Push(Vec::new())),
            1..=OP_PUSHBYTES_75 => {
                let len = byte as usize;
                let data = script
                    .get(pos..pos + len)
                    .ok_or_else(|| reject("truncated push"))?;
                ops.push(Op::Push(data.to_vec()));
                pos += len;
            }
            OP_VERIFY | OP_DUP | OP_EQUAL | OP_EQUALVERIFY | OP_HASH160 | OP_CHECKSIG => {
                ops.push(Op::Code(byte))
            }
            other => return Err(reject(format!("unsupported opcode 0x{:02x}", other))),
        }
    }
    Ok(ops)
}

fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    script.push(data.len() as u8);
    script.extend_from_slice(data);
}

/// `OP_DUP OP_HASH160 <pkh> OP_EQUALVERIFY OP_CHECKSIG`
pub fn p2pkh_locking_script(pkh: &[u8; PUB_KEY_HASH_SIZE]) -> Vec<u8> {
    let mut script = Vec::with_capacity(P2PKH_SCRIPT_LEN);
    script.push(OP_DUP);
    script.push(OP_HASH160);
    push_data(&mut script, pkh);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

/// `<signature> <public key>`
pub fn p2pkh_unlocking_script(der_signature: &[u8], public_key: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(2 + der_signature.len() + public_key.len());
    push_data(&mut script, der_signature);
    push_data(&mut script, public_key);
    script
}

/// Embedded key hash of a standard P2PKH locking script
pub fn extract_pkh(locking: &[u8]) -> Option<[u8; PUB_KEY_HASH_SIZE]> {
    if locking.len() != P2PKH_SCRIPT_LEN
        || locking[0] != OP_DUP
        || locking[1] != OP_HASH160
        || locking[2] as usize != PUB_KEY_HASH_SIZE
        || locking[23] != OP_EQUALVERIFY
        || locking[24] != OP_CHECKSIG
    {
        return None;
    }
    let mut pkh = [0u8; PUB_KEY_HASH_SIZE];
    pkh.copy_from_slice(&locking[3..23]);
    Some(pkh)
}

fn is_true(item: &[u8]) -> bool {
    match item.split_last() {
        None => false,
        Some((&last, rest)) => rest.iter().any(|&b| b != 0) || (last != 0 && last != 0x80),
    }
}

/// Stack machine running one unlocking plus locking script pair
pub struct ScriptEngine<'a> {
    mode: CheckMode<'a>,
    stack: Vec<Vec<u8>>,
}

impl<'a> ScriptEngine<'a> {
    pub fn new(mode: CheckMode<'a>) -> Self {
        Self {
            mode,
            stack: Vec::new(),
        }
    }

    fn pop(&mut self, op: &str) -> Result<Vec<u8>> {
        self.stack
            .pop()
            .ok_or_else(|| reject(format!("{} on empty stack", op)))
    }

    fn step(&mut self, op: Op) -> Result<()> {
        match op {
            Op::Push(data) => self.stack.push(data),
            Op::Code(OP_DUP) => {
                let top = self
                    .stack
                    .last()
                    .cloned()
                    .ok_or_else(|| reject("OP_DUP on empty stack"))?;
                self.stack.push(top);
            }
            Op::Code(OP_HASH160) => {
                let item = self.pop("OP_HASH160")?;
                let hashed = match self.mode {
                    CheckMode::KeyHash if item.len() == PUB_KEY_HASH_SIZE => item,
                    _ => crypto::hash160(&item).to_vec(),
                };
                self.stack.push(hashed);
            }
            Op::Code(code @ (OP_EQUAL | OP_EQUALVERIFY)) => {
                let a = self.pop("OP_EQUAL")?;
                let b = self.pop("OP_EQUAL")?;
                if code == OP_EQUALVERIFY {
                    if a != b {
                        return Err(reject("OP_EQUALVERIFY failed"));
                    }
                } else {
                    self.stack.push(vec![u8::from(a == b)]);
                }
            }
            Op::Code(OP_VERIFY) => {
                let top = self.pop("OP_VERIFY")?;
                if !is_true(&top) {
                    return Err(reject("OP_VERIFY failed"));
                }
            }
            Op::Code(OP_CHECKSIG) => {
                let public_key = self.pop("OP_CHECKSIG")?;
                let ok = match self.mode {
                    CheckMode::KeyHash => true,
                    CheckMode::Signature { message } => {
                        let signature = self.pop("OP_CHECKSIG")?;
                        crypto::verify_signature(&public_key, message, &signature)
                    }
                };
                self.stack.push(vec![u8::from(ok)]);
            }
            Op::Code(other) => return Err(reject(format!("unsupported opcode 0x{:02x}", other))),
        }
        Ok(())
    }

    /// Run `unlocking` then `locking`; succeeds when the final top is true
    pub fn run(mut self, unlocking: &[u8], locking: &[u8]) -> Result<()> {
        for op in parse(unlocking)?.into_iter().chain(parse(locking)?) {
            self.step(op)?;
        }
        match self.stack.last() {
            Some(top) if is_true(top) => Ok(()),
            Some(_) => Err(reject("script evaluated to false")),
            None => Err(reject("empty stack at end of script")),
        }
    }
}

/// Full P2PKH check: signature over `message` by a key hashing to the
/// script's embedded hash
pub fn verify_p2pkh(unlocking: &[u8], locking: &[u8], message: &[u8]) -> Result<()> {
    ScriptEngine::new(CheckMode::Signature { message }).run(unlocking, locking)
}

/// Delete authorization: does `locking` name `pub_key_hash` as its owner
pub fn verify_key_hash(locking: &[u8], pub_key_hash: &[u8; PUB_KEY_HASH_SIZE]) -> Result<()> {
    let mut unlocking = Vec::with_capacity(1 + PUB_KEY_HASH_SIZE);
    push_data(&mut unlocking, pub_key_hash);
    ScriptEngine::new(CheckMode::KeyHash).run(&unlocking, locking)
}
