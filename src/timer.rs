// The timer interrupts at one of four selectable frequencies. The Timer
// Counter (TIMA) is incremented at the rate chosen by TAC; when it overflows
// it is reloaded from the Timer Modulo (TMA) and the timer interrupt is
// requested. DIV runs freely regardless of TAC.
//
// See: http://gbdev.gg8.se/wiki/articles/Timer_and_Divider_Registers
use super::intf::{Interrupt, Intf};
use std::cell::RefCell;
use std::rc::Rc;

pub struct Timer {
    intf: Rc<RefCell<Intf>>,
    // FF04 - DIV. Incremented every 256 machine cycles; writing any value
    // resets it to 00h along with the pre-divider below.
    div: u8,
    // FF05 - TIMA. Incremented at the TAC rate, reloaded from TMA on
    // overflow.
    tima: u8,
    // FF06 - TMA.
    tma: u8,
    // FF07 - TAC:
    //   Bit  2   - Timer Enable
    //   Bits 1-0 - Input Clock Select
    //              00: 1024   01: 16   10: 64   11: 256 (dot cycles)
    tac: u8,
    div_cycles: u32,
    tima_cycles: u32,
}

impl Timer {
    pub fn power_up(intf: Rc<RefCell<Intf>>) -> Self {
        Self {
            intf,
            div: 0x00,
            tima: 0x00,
            tma: 0x00,
            tac: 0x00,
            div_cycles: 0,
            tima_cycles: 0,
        }
    }

    pub fn get(&self, a: u16) -> u8 {
        match a {
            0xff04 => self.div,
            0xff05 => self.tima,
            0xff06 => self.tma,
            0xff07 => self.tac,
            _ => panic!("Unsupported timer address"),
        }
    }

    pub fn set(&mut self, a: u16, v: u8) {
        match a {
            0xff04 => {
                self.div = 0x00;
                self.div_cycles = 0;
            }
            0xff05 => self.tima = v,
            0xff06 => self.tma = v,
            // Only the low 3 bits of TAC exist.
            0xff07 => self.tac = (self.tac & 0xf8) | (v & 0x07),
            _ => panic!("Unsupported timer address"),
        }
    }

    fn divisor(&self) -> u32 {
        match self.tac & 0x03 {
            0x00 => 1024,
            0x01 => 16,
            0x02 => 64,
            _ => 256,
        }
    }

    // Advance by a machine cycle count.
    pub fn next(&mut self, cycles: u32) {
        self.div_cycles += cycles;
        while self.div_cycles >= 256 {
            self.div = self.div.wrapping_add(1);
            self.div_cycles -= 256;
        }

        if self.tac & 0x04 != 0x00 {
            // The selected divisor counts dot cycles, 4 per machine cycle.
            self.tima_cycles += cycles * 4;
            let d = self.divisor();
            while self.tima_cycles >= d {
                self.tima = self.tima.wrapping_add(1);
                if self.tima == 0x00 {
                    self.tima = self.tma;
                    self.intf.borrow_mut().hi(Interrupt::Timer);
                }
                self.tima_cycles -= d;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer() -> (Timer, Rc<RefCell<Intf>>) {
        let intf = Rc::new(RefCell::new(Intf::power_up()));
        (Timer::power_up(intf.clone()), intf)
    }

    #[test]
    fn div_increments_every_256_cycles() {
        let (mut t, _) = timer();
        t.next(255);
        assert_eq!(t.get(0xff04), 0x00);
        t.next(1);
        assert_eq!(t.get(0xff04), 0x01);
        t.next(512);
        assert_eq!(t.get(0xff04), 0x03);
    }

    #[test]
    fn div_write_resets_counter_and_prescaler() {
        let (mut t, _) = timer();
        t.next(300);
        t.set(0xff04, 0xde);
        assert_eq!(t.get(0xff04), 0x00);
        // The pre-divider restarted too, so another full 256 cycles are
        // needed for the next step.
        t.next(255);
        assert_eq!(t.get(0xff04), 0x00);
        t.next(1);
        assert_eq!(t.get(0xff04), 0x01);
    }

    #[test]
    fn tima_idle_while_disabled() {
        let (mut t, intf) = timer();
        t.set(0xff07, 0x01);
        t.next(10_000);
        assert_eq!(t.get(0xff05), 0x00);
        assert_eq!(intf.borrow().data, 0x00);
    }

    #[test]
    fn tac_keeps_high_bits() {
        let (mut t, _) = timer();
        t.set(0xff07, 0xff);
        assert_eq!(t.get(0xff07), 0x07);
    }

    #[test]
    fn tima_overflow_reloads_tma_and_interrupts() {
        let (mut t, intf) = timer();
        t.set(0xff06, 0xab);
        t.set(0xff05, 0xff);
        // TAC=05h: enabled, divisor 16 dot cycles = 4 machine cycles.
        t.set(0xff07, 0x05);
        t.next(4);
        assert_eq!(t.get(0xff05), 0xab);
        assert_eq!(intf.borrow().data, 0x04);
    }

    #[test]
    fn tima_rate_follows_tac_select() {
        let (mut t, _) = timer();
        t.set(0xff07, 0x04);
        // Divisor 1024 dot cycles = 256 machine cycles per TIMA step.
        t.next(255);
        assert_eq!(t.get(0xff05), 0x00);
        t.next(1);
        assert_eq!(t.get(0xff05), 0x01);
    }
}
