//! Boot, exception vector and context switch stubs
//!
//! `_start` parks secondary cores, drops from EL2 to EL1, builds 1GB boot
//! mappings at physical 0x1000/0x2000 (identity in TTBR0, linear window in
//! TTBR1), turns the MMU on and continues at `kernel_main` in the high half.

use core::arch::global_asm;

// ═══════════════════════════════════════════════════════════════════════════════
// ENTRY
// ═══════════════════════════════════════════════════════════════════════════════

global_asm!(
    r#"
.section ".text.boot", "ax"
.global _start
_start:
    mrs     x1, mpidr_el1
    and     x1, x1, #3
    cbz     x1, 2f
1:  wfe
    b       1b

2:  mov     x19, x0                 // devicetree blob from the firmware

    mrs     x1, CurrentEL
    cmp     x1, #(2 << 2)
    b.ne    3f
    mov     x1, #(1 << 31)          // EL1 is AArch64
    msr     hcr_el2, x1
    mov     x1, #0x3c5              // EL1h, all exceptions masked
    msr     spsr_el2, x1
    adr     x1, 3f
    msr     elr_el2, x1
    eret

3:  mov     x1, #(3 << 20)          // no FP/SIMD traps
    msr     cpacr_el1, x1
    adr     x1, _start
    mov     sp, x1

    // Boot tables: PGD at 0x1000, PUD at 0x2000
    mov     x1, #0x1000
    mov     x2, #0x3000
4:  str     xzr, [x1], #8
    cmp     x1, x2
    b.lo    4b

    mov     x1, #0x1000
    mov     x2, #0x2000
    orr     x3, x2, #3              // table descriptor
    str     x3, [x1]
    mov     x3, #0x405              // 0..1GB: block, AF, normal non-cacheable
    str     x3, [x2]
    ldr     x3, =0x40000401         // 1..2GB: block, AF, device
    str     x3, [x2, #8]

    ldr     x3, =0x4400             // MAIR: 0 = device nGnRnE, 1 = normal NC
    msr     mair_el1, x3
    ldr     x3, =0x80100010         // TCR: 48-bit halves, 4KB granules
    msr     tcr_el1, x3
    msr     ttbr0_el1, x1
    msr     ttbr1_el1, x1
    isb

    mrs     x3, sctlr_el1
    orr     x3, x3, #1
    msr     sctlr_el1, x3
    isb

    ldr     x1, =__stack_top
    mov     sp, x1
    ldr     x1, =__bss_start
    ldr     x2, =__bss_end
5:  cmp     x1, x2
    b.hs    6f
    str     xzr, [x1], #8
    b       5b

6:  ldr     x1, =exception_vectors
    msr     vbar_el1, x1
    mov     x0, x19
    ldr     x1, =kernel_main
    blr     x1
7:  wfe
    b       7b
"#
);

// ═══════════════════════════════════════════════════════════════════════════════
// EXCEPTION VECTORS
// ═══════════════════════════════════════════════════════════════════════════════

// Trap frame layout (272 bytes): x0..x30 at 0..248, sp_el0 at 248,
// elr_el1 at 256, spsr_el1 at 264.
global_asm!(
    r#"
.macro save_frame
    sub     sp, sp, #272
    stp     x0, x1, [sp, #16 * 0]
    stp     x2, x3, [sp, #16 * 1]
    stp     x4, x5, [sp, #16 * 2]
    stp     x6, x7, [sp, #16 * 3]
    stp     x8, x9, [sp, #16 * 4]
    stp     x10, x11, [sp, #16 * 5]
    stp     x12, x13, [sp, #16 * 6]
    stp     x14, x15, [sp, #16 * 7]
    stp     x16, x17, [sp, #16 * 8]
    stp     x18, x19, [sp, #16 * 9]
    stp     x20, x21, [sp, #16 * 10]
    stp     x22, x23, [sp, #16 * 11]
    stp     x24, x25, [sp, #16 * 12]
    stp     x26, x27, [sp, #16 * 13]
    stp     x28, x29, [sp, #16 * 14]
    mrs     x21, sp_el0
    stp     x30, x21, [sp, #16 * 15]
    mrs     x22, elr_el1
    mrs     x23, spsr_el1
    stp     x22, x23, [sp, #16 * 16]
.endm

.macro restore_frame
    ldp     x22, x23, [sp, #16 * 16]
    msr     elr_el1, x22
    msr     spsr_el1, x23
    ldp     x30, x21, [sp, #16 * 15]
    msr     sp_el0, x21
    ldp     x0, x1, [sp, #16 * 0]
    ldp     x2, x3, [sp, #16 * 1]
    ldp     x4, x5, [sp, #16 * 2]
    ldp     x6, x7, [sp, #16 * 3]
    ldp     x8, x9, [sp, #16 * 4]
    ldp     x10, x11, [sp, #16 * 5]
    ldp     x12, x13, [sp, #16 * 6]
    ldp     x14, x15, [sp, #16 * 7]
    ldp     x16, x17, [sp, #16 * 8]
    ldp     x18, x19, [sp, #16 * 9]
    ldp     x20, x21, [sp, #16 * 10]
    ldp     x22, x23, [sp, #16 * 11]
    ldp     x24, x25, [sp, #16 * 12]
    ldp     x26, x27, [sp, #16 * 13]
    ldp     x28, x29, [sp, #16 * 14]
    add     sp, sp, #272
    eret
.endm

.macro vector target
    .balign 0x80
    b       \target
.endm

.macro invalid kind
    save_frame
    mov     x0, sp
    mov     x1, #\kind
    bl      unhandled_exception
    restore_frame
.endm

.section .text
.balign 0x800
.global exception_vectors
exception_vectors:
    vector  el1t_invalid
    vector  el1t_invalid
    vector  el1t_invalid
    vector  el1t_invalid

    vector  el1h_sync
    vector  el1h_irq
    vector  el1h_fiq
    vector  el1h_error

    vector  el0_sync
    vector  el0_irq
    vector  el0_fiq
    vector  el0_error

    vector  el0_32_invalid
    vector  el0_32_invalid
    vector  el0_32_invalid
    vector  el0_32_invalid

el1t_invalid:   invalid 0
el1h_fiq:       invalid 6
el1h_error:     invalid 7
el0_fiq:        invalid 10
el0_error:      invalid 11
el0_32_invalid: invalid 12

el1h_sync:
    save_frame
    mov     x0, sp
    bl      el1_sync_handler
    restore_frame

el1h_irq:
    save_frame
    mov     x0, sp
    bl      irq_handler
    restore_frame

el0_sync:
    save_frame
    mov     x0, sp
    bl      el0_sync_handler
    mov     x0, sp
    bl      return_to_user
    restore_frame

el0_irq:
    save_frame
    mov     x0, sp
    bl      irq_handler
    mov     x0, sp
    bl      return_to_user
    restore_frame
"#
);

// ═══════════════════════════════════════════════════════════════════════════════
// CONTEXT SWITCH AND EL0 ENTRY
// ═══════════════════════════════════════════════════════════════════════════════

global_asm!(
    r#"
.section .text
.global switch_to
switch_to:
    // x0 = prev context, x1 = next context
    stp     x19, x20, [x0, #0]
    stp     x21, x22, [x0, #16]
    stp     x23, x24, [x0, #32]
    stp     x25, x26, [x0, #48]
    stp     x27, x28, [x0, #64]
    stp     x29, x30, [x0, #80]
    mov     x9, sp
    str     x9, [x0, #96]

    // The incoming task's table goes live before its stack is touched
    ldr     x9, [x1, #104]
    dsb     ish
    msr     ttbr0_el1, x9
    tlbi    vmalle1is
    dsb     ish
    isb

    ldp     x19, x20, [x1, #0]
    ldp     x21, x22, [x1, #16]
    ldp     x23, x24, [x1, #32]
    ldp     x25, x26, [x1, #48]
    ldp     x27, x28, [x1, #64]
    ldp     x29, x30, [x1, #80]
    ldr     x9, [x1, #96]
    mov     sp, x9
    ret

.global enter_el0
enter_el0:
    // x0 = entry, x1 = user sp, x2 = kernel sp
    msr     daifset, #0xf
    msr     elr_el1, x0
    msr     sp_el0, x1
    mov     sp, x2
    msr     spsr_el1, xzr
    mov     x0, xzr
    mov     x1, xzr
    mov     x2, xzr
    mov     x3, xzr
    mov     x4, xzr
    mov     x5, xzr
    mov     x6, xzr
    mov     x7, xzr
    mov     x8, xzr
    mov     x29, xzr
    mov     x30, xzr
    eret

.section .text.sigreturn, "ax"
.global sigreturn_trampoline
sigreturn_trampoline:
    mov     x8, #10
    svc     #0
    b       sigreturn_trampoline
"#
);
