//! Interactive container picker: list containers, then prompt to mount or
//! unmount one. A single list-then-readline interaction, not worth pulling
//! in a TUI crate for.

use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::lifecycle::{ContainerEntry, Manager};

pub fn run(mgr: &Manager, changes_interval: Duration) -> Result<()> {
    loop {
        pick_and_act(mgr, changes_interval)?;
    }
}

fn pick_and_act(mgr: &Manager, changes_interval: Duration) -> Result<()> {
    let containers = mgr.list_containers()?;
    if containers.is_empty() {
        println!("No containers found.");
        return Ok(());
    }

    println!("Containers:");
    for (i, c) in containers.iter().enumerate() {
        let status = match &c.mount_point {
            Some(p) => format!("mounted at {}", p.display()),
            None => "not mounted".to_string(),
        };
        println!(
            "  [{i}] {} {} (from {}): {} [{status}]",
            c.short_id, c.name, c.image, c.command
        );
    }

    let index = prompt_index("Select container to mount/unmount", containers.len())?;
    let container = &containers[index];

    if container.mounted() {
        handle_mounted(mgr, container)
    } else {
        handle_unmounted(mgr, container, changes_interval)
    }
}

fn handle_mounted(mgr: &Manager, container: &ContainerEntry) -> Result<()> {
    let mount_point = container.mount_point.clone().expect("checked mounted() above");
    let answer = prompt_line(&format!(
        "Unmount container {} from {}? [y/N] ",
        container.short_id,
        mount_point.display()
    ))?;
    if answer.trim().eq_ignore_ascii_case("y") {
        mgr.unmount_container(&container.id, &mount_point)?;
    }
    Ok(())
}

fn handle_unmounted(
    mgr: &Manager,
    container: &ContainerEntry,
    changes_interval: Duration,
) -> Result<()> {
    let default = format!("./mount-{}", container.name);
    let input = prompt_line(&format!(
        "Choose path to mount container [{default}]: "
    ))?;
    let path = if input.trim().is_empty() {
        default
    } else {
        input.trim().to_string()
    };
    mgr.mount_container(
        &container.id,
        &PathBuf::from(path),
        changes_interval,
        false,
    )
}

fn prompt_line(label: &str) -> Result<String> {
    print!("{label}");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line)
}

fn prompt_index(label: &str, count: usize) -> Result<usize> {
    loop {
        let line = prompt_line(&format!("{label} (0-{}): ", count - 1))?;
        match line.trim().parse::<usize>() {
            Ok(i) if i < count => return Ok(i),
            _ => {
                if line.trim().is_empty() {
                    bail!("no selection made");
                }
                println!("invalid selection, try again");
            }
        }
    }
}
