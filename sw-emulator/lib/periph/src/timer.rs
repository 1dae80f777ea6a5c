/*++

Licensed under the Apache-2.0 license.

File Name:

    timer.rs

Abstract:

    File contains the programmable down-counting timers.

--*/

use serde::{Deserialize, Serialize};
use smlang::statemachine;
use tock_registers::interfaces::Readable;
use tock_registers::register_bitfields;
use tock_registers::registers::InMemoryRegister;
use vr0_emu_bus::{Access, ActionHandle, Bus, BusError, Clock, RegisterBank, RegisterDef, Timer};
use vr0_emu_types::{BusAddr, BusData, BusSize};

use crate::helpers::{decode_access, not_before, remaining};
use crate::intc::Irq;
use crate::PeriphError;

register_bitfields! [
    u32,

    /// Timer Control Register
    TmCon [
        ENABLE OFFSET(0) NUMBITS(1) [],
        PERIODIC OFFSET(1) NUMBITS(1) [],
        PRESCALE OFFSET(8) NUMBITS(8) [],
    ],
];

const TMCON: usize = 0;
const TMCNT: usize = 1;

static TIMER_REGS: [RegisterDef; 2] = [
    RegisterDef::new("TMCON", 0x0, BusSize::Word, 0, Access::ReadWrite),
    RegisterDef::new("TMCNT", 0x4, BusSize::HalfWord, 0, Access::ReadWrite),
];

/// Bytes of window each timer channel occupies.
pub const TIMER_STRIDE: BusAddr = 0x8;

statemachine! {
    transitions: {
        // CurrentState Event / action = NextState

        *Stopped + Enable / start = Running,
        Running + Disable / halt = Stopped,

        // The deadline passed with TMCON.PERIODIC set.
        Running + ExpirePeriodic / reload = Running,

        // The deadline passed with TMCON.PERIODIC clear.
        Running + ExpireOneShot / finish = Stopped,
    }
}

/// State machine extended variables.
pub struct Context {
    regs: RegisterBank,
    timer: Timer,

    /// Deadline of the current period.
    expiry: Option<ActionHandle>,

    /// Cycle the current period began at.
    period_start: u64,

    /// Cycles per count step, latched with the period.
    step_cycles: u64,

    /// TMCNT as it was when the period began.
    reload: u16,
}

impl Context {
    fn new(clock: &Clock) -> Self {
        Self {
            regs: RegisterBank::new(&TIMER_REGS),
            timer: clock.timer(),
            expiry: None,
            period_start: 0,
            step_cycles: 1,
            reload: 0,
        }
    }

    fn control(&self) -> InMemoryRegister<u32, TmCon::Register> {
        InMemoryRegister::new(self.regs.get(TMCON))
    }

    fn period(&self) -> u64 {
        (u64::from(self.reload) + 1) * self.step_cycles
    }

    /// Starts a period at `start`. When `start` lies more than a period in
    /// the past, the periods missed in between are skipped so the phase is
    /// kept and the deadline is after the current cycle.
    fn arm(&mut self, start: u64) {
        self.step_cycles = u64::from(self.control().read(TmCon::PRESCALE)) + 1;
        self.reload = self.regs.get(TMCNT) as u16;
        let period = self.period();
        let now = self.timer.now();
        let missed = if not_before(start, now) == start {
            0
        } else {
            now.wrapping_sub(start) / period
        };
        if missed > 0 {
            log::trace!("timer: {missed} missed period(s) skipped");
        }
        self.period_start = start.wrapping_add(missed * period);
        self.expiry = Some(
            self.timer
                .schedule_poll_at(self.period_start.wrapping_add(period)),
        );
    }

    fn disarm(&mut self) {
        if let Some(expiry) = self.expiry.take() {
            self.timer.cancel(expiry);
        }
    }

    fn elapsed(&self) -> u64 {
        self.timer.now().wrapping_sub(self.period_start)
    }

    /// Live count of a running period.
    fn count(&self) -> u16 {
        let steps = self.elapsed() / self.step_cycles;
        self.reload
            .saturating_sub(u16::try_from(steps).unwrap_or(u16::MAX))
    }
}

impl StateMachineContext for Context {
    fn start(&mut self) {
        self.arm(self.timer.now());
    }

    fn halt(&mut self) {
        self.disarm();
    }

    fn reload(&mut self) {
        // Periods run back to back no matter when the poll happened.
        let deadline = self.period_start.wrapping_add(self.period());
        self.arm(deadline);
    }

    fn finish(&mut self) {
        self.expiry = None;
        self.regs
            .clear_bits(TMCON, TmCon::ENABLE.mask << TmCon::ENABLE.shift);
    }
}

/// Saved timer channel state. Scheduling is kept relative to the clock.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct TimerSnapshot {
    pub regs: Vec<BusData>,
    pub running: bool,
    pub reload: u16,
    pub step_cycles: u64,

    /// Cycles since the current period began.
    pub elapsed: u64,

    /// Cycles until the current period ends.
    pub remaining: Option<u64>,
}

/// One down-counting timer. Counts from TMCNT to 0 once every
/// `TMCON.PRESCALE + 1` cycles and posts its interrupt when the count
/// wraps, which takes `(TMCNT + 1) * (PRESCALE + 1)` cycles.
pub struct TimerChannel {
    index: usize,
    state_machine: StateMachine<Context>,
    irq: Irq,
}

impl TimerChannel {
    pub fn new(index: usize, clock: &Clock, irq: Irq) -> Self {
        Self {
            index,
            state_machine: StateMachine::new(Context::new(clock)),
            irq,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state_machine.state, States::Running)
    }

    /// Current count: the live value while running, the reload value while
    /// stopped.
    pub fn count(&self) -> u16 {
        let context = self.state_machine.context();
        if self.is_running() {
            context.count()
        } else {
            context.regs.get(TMCNT) as u16
        }
    }

    pub(crate) fn defs(&self) -> &'static [RegisterDef] {
        &TIMER_REGS
    }

    fn stop(&mut self) {
        if self.is_running() {
            let _ = self.state_machine.process_event(Events::Disable);
        }
    }

    pub fn snapshot(&self) -> TimerSnapshot {
        let context = self.state_machine.context();
        let running = self.is_running();
        TimerSnapshot {
            regs: context.regs.values().to_vec(),
            running,
            reload: context.reload,
            step_cycles: context.step_cycles,
            elapsed: if running { context.elapsed() } else { 0 },
            remaining: remaining(&context.timer, &context.expiry),
        }
    }

    pub fn restore(&mut self, snapshot: &TimerSnapshot) -> Result<(), PeriphError> {
        if snapshot.regs.len() != TIMER_REGS.len() || snapshot.step_cycles == 0 {
            return Err(PeriphError::SnapshotMismatch("timer registers"));
        }
        self.stop();
        self.state_machine.context.regs.load(&snapshot.regs);
        if !snapshot.running {
            return Ok(());
        }
        let _ = self.state_machine.process_event(Events::Enable);
        let context = &mut self.state_machine.context;
        context.disarm();
        context.reload = snapshot.reload;
        context.step_cycles = snapshot.step_cycles;
        let now = context.timer.now();
        context.period_start = now.wrapping_sub(snapshot.elapsed);
        let remaining = snapshot
            .remaining
            .unwrap_or_else(|| context.period().saturating_sub(snapshot.elapsed));
        context.expiry = Some(context.timer.schedule_poll_in(remaining));
        Ok(())
    }
}

impl Bus for TimerChannel {
    fn read(&mut self, size: BusSize, addr: BusAddr) -> Result<BusData, BusError> {
        let Some(access) = decode_access(&self.state_machine.context().regs, "timer", addr, size)
        else {
            return Ok(0);
        };
        if access.index == TMCNT {
            return Ok(access.extract(BusData::from(self.count())));
        }
        Ok(self.state_machine.context.regs.read(&access))
    }

    fn write(&mut self, size: BusSize, addr: BusAddr, val: BusData) -> Result<(), BusError> {
        let context = &mut self.state_machine.context;
        let Some(access) = decode_access(&context.regs, "timer", addr, size) else {
            return Ok(());
        };
        let write = context.regs.write(&access, val);
        if write.index != TMCON {
            // A new TMCNT is picked up when the next period starts.
            return Ok(());
        }
        let enable = TmCon::ENABLE.mask << TmCon::ENABLE.shift;
        if write.rising() & enable != 0 {
            log::debug!("timer{}: start, reload {:#x}", self.index, context.regs.get(TMCNT));
            let _ = self.state_machine.process_event(Events::Enable);
        } else if write.falling() & enable != 0 {
            log::debug!("timer{}: stop", self.index);
            let _ = self.state_machine.process_event(Events::Disable);
        }
        Ok(())
    }

    fn poll(&mut self) {
        let context = &mut self.state_machine.context;
        if !context.timer.fired(&mut context.expiry) {
            return;
        }
        let event = if context.control().is_set(TmCon::PERIODIC) {
            Events::ExpirePeriodic
        } else {
            Events::ExpireOneShot
        };
        log::trace!("timer{}: expired", self.index);
        let _ = self.state_machine.process_event(event);
        self.irq.post();
    }

    fn reset(&mut self) {
        self.stop();
        self.state_machine.context.regs.reset();
    }
}
