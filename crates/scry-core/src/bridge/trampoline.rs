//! x86-64 machine code for the call trampoline and the hook-site jump.
//!
//! Everything architecture specific lives here. The trampoline is position
//! independent apart from the absolute addresses baked into it (mailbox and
//! return address), so it can be built before the cave is chosen.
//!
//! Trampoline layout:
//!
//! ```text
//!   pushfq; push rax, rcx, rdx, rbx, rbp, rsi, rdi, r8, r9, r10, r11
//!   mov  rbx, <mailbox>
//!   xor  eax, eax
//!   xchg [rbx], rax            ; claim and disarm the function slot atomically
//!   test rax, rax
//!   jz   restore
//!   mov  rsi, [rbx+0x30]       ; ticket of the claimed call
//!   mov  rcx, [rbx+0x08]       ; Win64 argument registers
//!   mov  rdx, [rbx+0x10]
//!   mov  r8,  [rbx+0x18]
//!   mov  r9,  [rbx+0x20]
//!   mov  rbp, rsp
//!   and  rsp, -16              ; callee expects a 16-byte aligned stack
//!   sub  rsp, 0x80             ; shadow space + xmm0-xmm5 save area
//!   movdqu [rsp+0x20+16*n], xmmN   (n = 0..5)
//!   call rax
//!   movdqu xmmN, [rsp+0x20+16*n]   (n = 0..5)
//!   mov  rsp, rbp
//!   mov  [rbx+0x28], rax       ; result
//!   mov  [rbx+0x38], rsi       ; completed = ticket (after result)
//! restore:
//!   pop r11, r10, r9, r8, rdi, rsi, rbp, rbx, rdx, rcx, rax; popfq
//!   <stolen bytes>
//!   jmp  [rip+0]; dq <hook + stolen_len>
//! ```
//!
//! The stolen bytes are replayed verbatim, so the hook site must not contain
//! RIP-relative operands or branches inside the first `stolen_len` bytes.

use crate::bridge::mailbox;
use crate::error::{Error, Result};

/// Length of `jmp [rip+0]; dq target`
pub const ABS_JUMP_LEN: usize = 14;

const NOP: u8 = 0x90;

/// Volatile vector registers that may carry the hooked function's arguments
const SAVED_XMM: u8 = 6;

/// Shadow space below the xmm save area
const SHADOW_SPACE: u8 = 0x20;

/// Saved in this order, restored in reverse
const SAVE_REGS: &[&[u8]] = &[
    &[0x9C],       // pushfq
    &[0x50],       // push rax
    &[0x51],       // push rcx
    &[0x52],       // push rdx
    &[0x53],       // push rbx
    &[0x55],       // push rbp
    &[0x56],       // push rsi
    &[0x57],       // push rdi
    &[0x41, 0x50], // push r8
    &[0x41, 0x51], // push r9
    &[0x41, 0x52], // push r10
    &[0x41, 0x53], // push r11
];

const RESTORE_REGS: &[&[u8]] = &[
    &[0x41, 0x5B], // pop r11
    &[0x41, 0x5A], // pop r10
    &[0x41, 0x59], // pop r9
    &[0x41, 0x58], // pop r8
    &[0x5F],       // pop rdi
    &[0x5E],       // pop rsi
    &[0x5D],       // pop rbp
    &[0x5B],       // pop rbx
    &[0x5A],       // pop rdx
    &[0x59],       // pop rcx
    &[0x58],       // pop rax
    &[0x9D],       // popfq
];

/// `jmp qword ptr [rip+0]` followed by the 8-byte target.
pub fn absolute_jump(target: u64) -> [u8; ABS_JUMP_LEN] {
    let mut out = [0u8; ABS_JUMP_LEN];
    out[..6].copy_from_slice(&[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
    out[6..].copy_from_slice(&target.to_le_bytes());
    out
}

/// True if `bytes` starts with the jump emitted by [`absolute_jump`].
pub fn is_absolute_jump(bytes: &[u8]) -> bool {
    bytes.starts_with(&[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00])
}

/// Patch for the hook site: an absolute jump to `target`, NOP padded to `len`.
pub fn hook_patch(target: u64, len: usize) -> Result<Vec<u8>> {
    if len < ABS_JUMP_LEN {
        return Err(Error::HookInstallFailed(format!(
            "hook site needs at least {} bytes, got {}",
            ABS_JUMP_LEN, len
        )));
    }
    let mut patch = absolute_jump(target).to_vec();
    patch.resize(len, NOP);
    Ok(patch)
}

/// Builds the trampoline image.
#[derive(Debug, Clone)]
pub struct TrampolineBuilder {
    mailbox: u64,
    hook_address: u64,
    stolen: Vec<u8>,
}

impl TrampolineBuilder {
    pub fn new(mailbox: u64, hook_address: u64, stolen: Vec<u8>) -> Self {
        Self {
            mailbox,
            hook_address,
            stolen,
        }
    }

    /// Address execution resumes at after the trampoline
    pub fn return_address(&self) -> u64 {
        self.hook_address + self.stolen.len() as u64
    }

    pub fn build(&self) -> Vec<u8> {
        let mut code = Vec::with_capacity(160 + self.stolen.len());

        for op in SAVE_REGS {
            code.extend_from_slice(op);
        }

        // mov rbx, imm64
        code.extend_from_slice(&[0x48, 0xBB]);
        code.extend_from_slice(&self.mailbox.to_le_bytes());
        // xor eax, eax
        code.extend_from_slice(&[0x31, 0xC0]);
        // xchg [rbx], rax
        code.extend_from_slice(&[0x48, 0x87, 0x03]);
        // test rax, rax
        code.extend_from_slice(&[0x48, 0x85, 0xC0]);

        let dispatch = self.dispatch();
        // jz rel8 over the dispatch block
        code.extend_from_slice(&[0x74, dispatch.len() as u8]);
        code.extend_from_slice(&dispatch);

        for op in RESTORE_REGS {
            code.extend_from_slice(op);
        }

        code.extend_from_slice(&self.stolen);
        code.extend_from_slice(&absolute_jump(self.return_address()));
        code
    }

    fn dispatch(&self) -> Vec<u8> {
        let disp = |offset: u64| offset as u8;
        let mut code = Vec::with_capacity(64);
        // mov rsi, [rbx+TICKET]
        code.extend_from_slice(&[0x48, 0x8B, 0x73, disp(mailbox::TICKET)]);
        // mov rcx, [rbx+ARGS]
        code.extend_from_slice(&[0x48, 0x8B, 0x4B, disp(mailbox::ARGS)]);
        // mov rdx, [rbx+ARGS+8]
        code.extend_from_slice(&[0x48, 0x8B, 0x53, disp(mailbox::ARGS + 8)]);
        // mov r8, [rbx+ARGS+16]
        code.extend_from_slice(&[0x4C, 0x8B, 0x43, disp(mailbox::ARGS + 16)]);
        // mov r9, [rbx+ARGS+24]
        code.extend_from_slice(&[0x4C, 0x8B, 0x4B, disp(mailbox::ARGS + 24)]);
        // mov rbp, rsp
        code.extend_from_slice(&[0x48, 0x89, 0xE5]);
        // and rsp, -16
        code.extend_from_slice(&[0x48, 0x83, 0xE4, 0xF0]);
        // sub rsp, imm32
        let frame = SHADOW_SPACE as u32 + 16 * SAVED_XMM as u32;
        code.extend_from_slice(&[0x48, 0x81, 0xEC]);
        code.extend_from_slice(&frame.to_le_bytes());
        for xmm in 0..SAVED_XMM {
            // movdqu [rsp+disp8], xmmN
            code.extend_from_slice(&xmm_spill(0x7F, xmm));
        }
        // call rax
        code.extend_from_slice(&[0xFF, 0xD0]);
        for xmm in 0..SAVED_XMM {
            // movdqu xmmN, [rsp+disp8]
            code.extend_from_slice(&xmm_spill(0x6F, xmm));
        }
        // mov rsp, rbp
        code.extend_from_slice(&[0x48, 0x89, 0xEC]);
        // mov [rbx+RESULT], rax
        code.extend_from_slice(&[0x48, 0x89, 0x43, disp(mailbox::RESULT)]);
        // mov [rbx+COMPLETED], rsi
        code.extend_from_slice(&[0x48, 0x89, 0x73, disp(mailbox::COMPLETED)]);
        code
    }

    /// Size of the image [`build`](Self::build) produces.
    pub fn image_len(&self) -> usize {
        self.build().len()
    }
}

/// `movdqu` between `xmm` and its slot above the shadow space; `opcode` is
/// 0x7F to store, 0x6F to load.
fn xmm_spill(opcode: u8, xmm: u8) -> [u8; 6] {
    [
        0xF3,
        0x0F,
        opcode,
        0x44 | (xmm << 3),
        0x24,
        SHADOW_SPACE + 16 * xmm,
    ]
}
