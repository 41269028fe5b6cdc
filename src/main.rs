use oxitop::{sample_bottles, ProtocolServer, SerialSettings};
use std::io::{self, BufRead, Write};

// Reads a trimmed line from stdin; `None` on EOF or a broken terminal.
fn prompt(message: &str) -> Option<String> {
    print!("{}", message);
    io::stdout().flush().ok()?;
    let mut input = String::new();
    match io::stdin().read_line(&mut input) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(input.trim().to_string()),
    }
}

// The main entry point for the command-line emulator.
fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("=========================");
    println!("   OxiTop OC110 Emulator  ");
    println!("=========================");

    // List available serial ports.
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            eprintln!("[ERROR] Could not enumerate serial ports: {}", e);
            return;
        }
    };

    if ports.is_empty() {
        eprintln!("[ERROR] No serial ports found.");
        return;
    }

    println!("Available serial ports:");
    for (i, port) in ports.iter().enumerate() {
        println!("  {}: {}", i, port.port_name);
    }

    // Get user's choice of serial port.
    let Some(port_choice) = prompt("Select a port (number): ") else {
        return;
    };
    let port_name = match port_choice.parse::<usize>() {
        Ok(i) if i < ports.len() => &ports[i].port_name,
        _ => {
            eprintln!("[ERROR] Invalid port selection.");
            return;
        }
    };

    let bottles = match sample_bottles() {
        Ok(bottles) => bottles,
        Err(e) => {
            eprintln!("[ERROR] Invalid sample data: {}", e);
            return;
        }
    };

    // The port itself is opened by the emulator thread.
    let transport = SerialSettings::default().build(port_name);
    let handle = match ProtocolServer::spawn(transport, bottles) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("[ERROR] Failed to start emulator: {}", e);
            return;
        }
    };

    println!(
        "\nEmulating an OC110 on {} at {} baud. Type 'quit' to exit.",
        port_name,
        SerialSettings::DEFAULT_BAUD_RATE
    );

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        match line {
            Ok(input) if input.trim() == "quit" => break,
            Ok(_) => println!("Type 'quit' to exit."),
            Err(_) => break,
        }
    }

    // The serial read times out on its own, so the flag is enough here.
    println!("Stopping emulator...");
    handle.terminate();
    if handle.join().is_err() {
        eprintln!("[ERROR] Emulator thread panicked.");
    }
}
