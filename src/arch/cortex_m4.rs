//! # Cortex-M4 Port Layer
//!
//! Hardware-specific code for the ARM Cortex-M4 (Thumb-2) processor.
//! Implements context switching via PendSV, SysTick configuration and
//! the first-task launch, and hosts the board's [`KERNEL`] instance.
//!
//! ## Context Switch Mechanism
//!
//! The Cortex-M4 uses a split-stack model:
//! - **MSP** (Main Stack Pointer): used by the kernel and interrupt handlers
//! - **PSP** (Process Stack Pointer): used by tasks in Thread mode
//!
//! On exception entry, the hardware stacks R0–R3, R12, LR, PC and xPSR
//! onto the process stack. PendSV saves and restores R4–R11 around a call
//! to [`Kernel::switch_context`], which swaps stack pointers in the TCBs.
//! Tasks must not use the FPU: only the basic frame is handled.
//!
//! ## Interrupt Priorities
//!
//! - SysTick: 0xFF (lowest)
//! - PendSV: 0xFF (lowest), so a switch never preempts another handler
//!
//! The kernel lock masks PendSV through PRIMASK; a switch requested
//! inside a critical section happens as soon as it ends.

use core::arch::{asm, naked_asm};

use cortex_m::peripheral::scb::{SystemHandler, VectActive};
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::SCB;
use cortex_m_rt::exception;

use super::{Port, TaskEntryFn};
use crate::config::{SYSTEM_CLOCK_HZ, TICK_HZ};
use crate::kernel::Kernel;
use crate::task::TaskId;

/// The system's kernel instance.
pub static KERNEL: Kernel<CortexM4> = Kernel::new(CortexM4::new());

/// Words in the initial frame: R4–R11, then the hardware frame.
const INITIAL_FRAME_WORDS: usize = 16;

/// xPSR with only the Thumb bit set.
const INITIAL_XPSR: u32 = 0x0100_0000;

/// Port for ARMv7E-M.
pub struct CortexM4 {
    _private: (),
}

impl CortexM4 {
    const fn new() -> Self {
        Self { _private: () }
    }
}

// ---------------------------------------------------------------------------
// Kernel entry points
// ---------------------------------------------------------------------------

/// Prepare the core for the kernel. Call once from `main` before creating
/// any kernel object.
pub fn kernel_init() {
    set_interrupt_priorities();
}

/// Start scheduling. Never returns.
pub fn kernel_start() -> ! {
    if let Err(e) = KERNEL.start() {
        panic!("kernel start failed: {}", e);
    }
    loop {
        cortex_m::asm::wfi();
    }
}

// ---------------------------------------------------------------------------
// Port implementation
// ---------------------------------------------------------------------------

impl Port for CortexM4 {
    /// Lay down the initial frame for a first "exception return" into
    /// `entry(arg)`.
    ///
    /// ```text
    /// [Hardware stacked frame]   <- top, 8-byte aligned
    ///   xPSR  (Thumb bit set)
    ///   PC    (entry)
    ///   LR    (task_exit)
    ///   R12, R3, R2, R1 (0)
    ///   R0    (arg)
    /// [Software saved context]
    ///   R11 … R4 (0)             <- returned stack pointer
    /// ```
    fn prepare_stack(&self, stack: &mut [u32], entry: TaskEntryFn, arg: usize) -> usize {
        let base = stack.as_ptr() as usize;
        let mut top = stack.len();
        if (base + top * 4) % 8 != 0 {
            top -= 1;
        }
        let frame = top - INITIAL_FRAME_WORDS;

        stack[frame..top].fill(0);
        stack[frame + 8] = arg as u32;
        stack[frame + 13] = task_exit as usize as u32;
        // Exception return wants the PC with the Thumb bit clear.
        stack[frame + 14] = (entry as usize as u32) & !1;
        stack[frame + 15] = INITIAL_XPSR;

        base + frame * 4
    }

    #[inline]
    fn trigger_context_switch(&self, _from: TaskId, _to: TaskId) {
        SCB::set_pendsv();
    }

    fn start_first_task(&self, stack_pointer: usize) {
        // SAFETY: called once from `Kernel::start` with the stack pointer
        // `prepare_stack` produced for the first task.
        unsafe { start_first_task(stack_pointer as *const u32) }
    }

    #[inline]
    fn is_interrupt_context(&self) -> bool {
        SCB::vect_active() != VectActive::ThreadMode
    }

    fn system_tick_init(&self) {
        // SAFETY: SysTick is owned by the kernel; nothing else holds it.
        let mut syst = unsafe { cortex_m::Peripherals::steal() }.SYST;
        syst.set_reload(SYSTEM_CLOCK_HZ / TICK_HZ - 1);
        syst.clear_current();
        syst.set_clock_source(SystClkSource::Core);
        syst.enable_counter();
        syst.enable_interrupt();
    }

    fn wait_for_dispatch(&self, _task: TaskId) {
        // PendSV is pending; it fires as soon as interrupts are unmasked.
        cortex_m::asm::nop();
    }

    fn idle(&self) {
        cortex_m::asm::wfi();
    }
}

/// Set PendSV and SysTick to the lowest interrupt priority.
fn set_interrupt_priorities() {
    // SAFETY: run once before the scheduler starts; no priority-based
    // critical sections exist yet.
    unsafe {
        let mut scb = cortex_m::Peripherals::steal().SCB;
        scb.set_priority(SystemHandler::PendSV, 0xFF);
        scb.set_priority(SystemHandler::SysTick, 0xFF);
    }
}

/// Return address of every task's entry. Task entries never return.
extern "C" fn task_exit() -> ! {
    loop {
        cortex_m::asm::bkpt();
    }
}

// ---------------------------------------------------------------------------
// First task launch
// ---------------------------------------------------------------------------

/// Switch Thread mode to PSP and jump into the first task.
///
/// # Safety
/// Must only be called once, with a stack pointer from `prepare_stack`.
unsafe fn start_first_task(psp: *const u32) -> ! {
    asm!(
        // Skip the software-saved R4–R11.
        "adds r0, #32",
        "msr psp, r0",

        // Thread mode uses PSP from here on (CONTROL.SPSEL = 1).
        "movs r0, #2",
        "msr control, r0",
        "isb",

        // Unstack the hardware frame by hand; this is not a real
        // exception return.
        "pop {{r0-r3, r12}}",  // R0 = task argument
        "pop {{r4}}",          // LR
        "pop {{r5}}",          // PC
        "pop {{r6}}",          // xPSR, discarded
        "mov lr, r4",
        "orr r5, r5, #1",      // back to a Thumb branch target

        "cpsie i",
        "bx r5",

        in("r0") psp,
        options(noreturn)
    );
}

// ---------------------------------------------------------------------------
// Exception handlers
// ---------------------------------------------------------------------------

/// PendSV exception handler: performs the context switch.
///
/// ## Sequence
/// 1. Save R4–R11 onto the outgoing task's stack (PSP)
/// 2. `Kernel::switch_context(psp)` stores it and returns the incoming PSP
/// 3. Restore R4–R11 from the incoming task's stack
/// 4. Return from exception on PSP
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn PendSV() {
    naked_asm!(
        "mrs r0, psp",
        "stmdb r0!, {{r4-r11}}",

        // Keep EXC_RETURN across the call; r3 pads MSP to 8 bytes.
        "push {{r3, lr}}",
        "bl {switch}",
        "pop {{r3, lr}}",

        "ldmia r0!, {{r4-r11}}",
        "msr psp, r0",
        "bx lr",

        switch = sym pendsv_switch,
    );
}

extern "C" fn pendsv_switch(saved_sp: usize) -> usize {
    KERNEL.switch_context(saved_sp)
}

/// SysTick exception handler: the kernel tick.
#[exception]
fn SysTick() {
    KERNEL.tick();
}
