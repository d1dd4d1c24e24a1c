#[cfg(feature = "gui")]
use dmg::error::Error;

#[cfg(feature = "gui")]
fn main() {
    rog::reg("dmg");
    rog::reg("dmg::cartridge");
    rog::reg("dmg::cpu");

    if let Err(e) = run() {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

// Machine cycles per 59.7 Hz frame: 70224 dots at 4 dots per cycle.
#[cfg(feature = "gui")]
const CYCLES_PER_FRAME: u32 = 17_556;

#[cfg(feature = "gui")]
fn run() -> Result<(), Error> {
    use dmg::joypad::JoypadKey;
    use dmg::machine::Machine;
    use dmg::ppu::{SCREEN_H, SCREEN_W};
    use std::io::Write;

    let mut rom = String::from("");
    let mut boot = String::from("");
    let mut c_scale = 2;
    {
        let mut ap = argparse::ArgumentParser::new();
        ap.set_description("Game Boy emulator");
        ap.refer(&mut boot)
            .add_option(&["-b", "--boot-rom"], argparse::Store, "Path to a 256 byte boot ROM image");
        ap.refer(&mut c_scale).add_option(
            &["-x", "--scale-factor"],
            argparse::Store,
            "Scale the video by a factor of 1, 2, 4, or 8",
        );
        ap.refer(&mut rom).add_argument("rom", argparse::Store, "Rom name");
        ap.parse_args_or_exit();
    }

    let cart = dmg::cartridge::power_up(&rom)?;
    let mut machine = Machine::power_up(cart);
    if !boot.is_empty() {
        let bytes = std::fs::read(&boot).map_err(|e| Error::CartridgeRead {
            path: boot.clone(),
            reason: e.to_string(),
        })?;
        machine.load_boot_rom(bytes);
    }

    // Blargg's test ROMs report through the link port; forward it.
    machine.set_serial_sink(Box::new(|b| {
        print!("{}", b as char);
        let _ = std::io::stdout().flush();
    }));

    let mut option = minifb::WindowOptions::default();
    option.resize = true;
    option.scale = match c_scale {
        1 => minifb::Scale::X1,
        2 => minifb::Scale::X2,
        4 => minifb::Scale::X4,
        8 => minifb::Scale::X8,
        _ => return Err(Error::HostInit(String::from("supported scale: 1, 2, 4 or 8"))),
    };
    let title = format!("Game Boy - {}", machine.title());
    let mut window = minifb::Window::new(title.as_str(), SCREEN_W, SCREEN_H, option)
        .map_err(|e| Error::HostInit(e.to_string()))?;
    let mut window_buffer = vec![0x00u32; SCREEN_W * SCREEN_H];
    window
        .update_with_buffer(window_buffer.as_slice())
        .map_err(|e| Error::HostInit(e.to_string()))?;

    let frame_duration = std::time::Duration::from_micros(16_743);
    let mut frame_start = std::time::Instant::now();
    let mut cycles: u32 = 0;

    let keys = [
        (minifb::Key::Right, JoypadKey::Right),
        (minifb::Key::Up, JoypadKey::Up),
        (minifb::Key::Left, JoypadKey::Left),
        (minifb::Key::Down, JoypadKey::Down),
        (minifb::Key::Z, JoypadKey::A),
        (minifb::Key::X, JoypadKey::B),
        (minifb::Key::Space, JoypadKey::Select),
        (minifb::Key::Enter, JoypadKey::Start),
    ];

    loop {
        // The shutdown signal lands between two instructions.
        if !window.is_open() || window.is_key_down(minifb::Key::Escape) {
            break;
        }

        cycles += machine.step();

        if machine.take_frame() {
            for (i, chunk) in machine.frame_data().chunks(4).enumerate() {
                let r = u32::from(chunk[0]);
                let g = u32::from(chunk[1]);
                let b = u32::from(chunk[2]);
                window_buffer[i] = (r << 16) | (g << 8) | b;
            }
            window
                .update_with_buffer(window_buffer.as_slice())
                .map_err(|e| Error::HostInit(e.to_string()))?;
        }

        if cycles >= CYCLES_PER_FRAME {
            cycles -= CYCLES_PER_FRAME;
            for (host, guest) in keys.iter() {
                if window.is_key_down(*host) {
                    machine.keydown(*guest);
                } else {
                    machine.keyup(*guest);
                }
            }
            let elapsed = frame_start.elapsed();
            if elapsed < frame_duration {
                std::thread::sleep(frame_duration - elapsed);
            }
            frame_start = std::time::Instant::now();
        }
    }
    Ok(())
}

#[cfg(not(feature = "gui"))]
fn main() {
    eprintln!("built without the gui feature");
    std::process::exit(1);
}
