// The top level loop. One step is one instruction: dispatch it, hand the
// cycle count to the PPU and the timer, then deliver whatever interrupts
// became pending. Everything the emulated system owns hangs off this
// context; there are no globals.
use super::bus::Bus;
use super::cartridge::Cartridge;
use super::cpu::Cpu;
use super::joypad::JoypadKey;
use super::serial::SerialSink;

pub struct Machine {
    pub cpu: Cpu,
    pub bus: Bus,
}

impl Machine {
    pub fn power_up(cartridge: Box<dyn Cartridge>) -> Self {
        Self {
            cpu: Cpu::power_up(),
            bus: Bus::power_up(cartridge),
        }
    }

    // Install a boot image. Execution then starts at 0000h under the
    // overlay instead of the post boot entry point.
    pub fn load_boot_rom(&mut self, bytes: Vec<u8>) {
        self.bus.load_boot_rom(bytes);
        self.cpu.reg.pc = 0x0000;
    }

    // Run a single instruction and return the machine cycles it consumed,
    // including interrupt dispatch overhead.
    pub fn step(&mut self) -> u32 {
        let c = self.cpu.next(&mut self.bus);
        self.bus.ppu.next(c);
        self.bus.timer.next(c);
        c + self.cpu.handle_interrupts(&mut self.bus)
    }

    // True once per completed frame; resets the flag.
    pub fn take_frame(&mut self) -> bool {
        let updated = self.bus.ppu.updated;
        self.bus.ppu.updated = false;
        updated
    }

    // The current 160x144 RGBA image.
    pub fn frame_data(&self) -> &[u8] {
        &self.bus.ppu.data
    }

    pub fn set_serial_sink(&mut self, sink: SerialSink) {
        self.bus.serial.set_sink(sink);
    }

    pub fn keydown(&mut self, key: JoypadKey) {
        self.bus.joypad.keydown(key);
    }

    pub fn keyup(&mut self, key: JoypadKey) {
        self.bus.joypad.keyup(key);
    }

    pub fn title(&self) -> String {
        self.bus.cartridge.title()
    }
}
