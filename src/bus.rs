// The bus arbitrates every 16 bit guest address. The cartridge windows are
// delegated to the active MBC through its narrow capability, the mapped
// peripherals own their register sub ranges, and the bus itself keeps work
// RAM, high RAM, the interrupt registers, the boot ROM overlay and the
// leftover I/O bytes.
use super::cartridge::Cartridge;
use super::intf::Intf;
use super::joypad::Joypad;
use super::memory::Memory;
use super::ppu::Ppu;
use super::serial::Serial;
use super::timer::Timer;
use std::cell::RefCell;
use std::rc::Rc;

pub struct Bus {
    pub cartridge: Box<dyn Cartridge>,
    pub ppu: Ppu,
    pub joypad: Joypad,
    pub serial: Serial,
    pub timer: Timer,
    pub intf: Rc<RefCell<Intf>>,
    inte: u8,
    wram: [u8; 0x2000],
    hram: [u8; 0x7f],
    // Stored bytes for I/O ports without a dedicated owner (sound range,
    // DMA source, boot latch register).
    io: [u8; 0x80],
    boot_rom: Vec<u8>,
    boot_active: bool,
}

impl Bus {
    pub fn power_up(cartridge: Box<dyn Cartridge>) -> Self {
        let intf = Rc::new(RefCell::new(Intf::power_up()));
        let mut r = Self {
            cartridge,
            ppu: Ppu::power_up(intf.clone()),
            joypad: Joypad::power_up(intf.clone()),
            serial: Serial::power_up(),
            timer: Timer::power_up(intf.clone()),
            intf,
            inte: 0x00,
            wram: [0x00; 0x2000],
            hram: [0x00; 0x7f],
            io: [0x00; 0x80],
            boot_rom: Vec::new(),
            boot_active: false,
        };
        // Register values the boot ROM normally leaves behind.
        r.set(0xff05, 0x00);
        r.set(0xff06, 0x00);
        r.set(0xff07, 0x00);
        r.set(0xff10, 0x80);
        r.set(0xff11, 0xbf);
        r.set(0xff12, 0xf3);
        r.set(0xff14, 0xbf);
        r.set(0xff16, 0x3f);
        r.set(0xff17, 0x00);
        r.set(0xff19, 0xbf);
        r.set(0xff1a, 0x7f);
        r.set(0xff1b, 0xff);
        r.set(0xff1c, 0x9f);
        r.set(0xff1e, 0xff);
        r.set(0xff20, 0xff);
        r.set(0xff21, 0x00);
        r.set(0xff22, 0x00);
        r.set(0xff23, 0xbf);
        r.set(0xff24, 0x77);
        r.set(0xff25, 0xf3);
        r.set(0xff26, 0xf1);
        r.set(0xff40, 0x91);
        r.set(0xff42, 0x00);
        r.set(0xff43, 0x00);
        r.set(0xff45, 0x00);
        r.set(0xff47, 0xfc);
        r.set(0xff48, 0xff);
        r.set(0xff49, 0xff);
        r.set(0xff4a, 0x00);
        r.set(0xff4b, 0x00);
        r
    }

    // Install the 256 byte boot image under the overlay. Reads below 0100h
    // hit it until the guest writes FF50.
    pub fn load_boot_rom(&mut self, mut bytes: Vec<u8>) {
        bytes.resize(0x100, 0x00);
        self.boot_rom = bytes;
        self.boot_active = true;
    }

    pub fn boot_active(&self) -> bool {
        self.boot_active
    }

    // One shot: the overlay never comes back within a session.
    pub fn disable_boot(&mut self) {
        self.boot_active = false;
    }

    // FF46: copy 160 bytes from v << 8 into OAM, synchronously.
    fn run_dma(&mut self, v: u8) {
        let base = u16::from(v) << 8;
        for i in 0..0xa0 {
            let b = self.get(base + i);
            self.ppu.set(0xfe00 + i, b);
        }
    }
}

impl Memory for Bus {
    fn get(&self, a: u16) -> u8 {
        match a {
            0x0000..=0x00ff if self.boot_active => self.boot_rom[a as usize],
            0x0000..=0x7fff => self.cartridge.read_rom(a),
            0x8000..=0x9fff => self.ppu.get(a),
            0xa000..=0xbfff => self.cartridge.read_ram(a),
            0xc000..=0xdfff => self.wram[a as usize - 0xc000],
            0xe000..=0xfdff => self.wram[a as usize - 0xe000],
            0xfe00..=0xfe9f => self.ppu.get(a),
            0xfea0..=0xfeff => 0x00,
            0xff00 => self.joypad.get(a),
            0xff01..=0xff02 => self.serial.get(a),
            0xff04..=0xff07 => self.timer.get(a),
            0xff0f => self.intf.borrow().data,
            0xff40..=0xff45 | 0xff47..=0xff4b => self.ppu.get(a),
            0xff00..=0xff7f => self.io[a as usize - 0xff00],
            0xff80..=0xfffe => self.hram[a as usize - 0xff80],
            0xffff => self.inte,
        }
    }

    fn set(&mut self, a: u16, v: u8) {
        match a {
            // Stores into the ROM window drive the banking registers.
            0x0000..=0x7fff => self.cartridge.write_registers(a, v),
            0x8000..=0x9fff => self.ppu.set(a, v),
            0xa000..=0xbfff => self.cartridge.write_ram(a, v),
            0xc000..=0xdfff => self.wram[a as usize - 0xc000] = v,
            0xe000..=0xfdff => self.wram[a as usize - 0xe000] = v,
            0xfe00..=0xfe9f => self.ppu.set(a, v),
            0xfea0..=0xfeff => {}
            0xff00 => self.joypad.set(a, v),
            0xff01..=0xff02 => self.serial.set(a, v),
            0xff04..=0xff07 => self.timer.set(a, v),
            0xff0f => self.intf.borrow_mut().data = v,
            0xff40..=0xff45 | 0xff47..=0xff4b => self.ppu.set(a, v),
            0xff46 => {
                self.io[0x46] = v;
                self.run_dma(v);
            }
            0xff50 => {
                self.io[0x50] = v;
                self.disable_boot();
            }
            0xff00..=0xff7f => self.io[a as usize - 0xff00] = v,
            0xff80..=0xfffe => self.hram[a as usize - 0xff80] = v,
            0xffff => self.inte = v,
        }
    }
}
