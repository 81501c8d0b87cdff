//! Text rendering for console output

use outpost_control::{Job, SessionInfo};
use outpost_proto::{DirList, Process};

pub const INFO: &str = "[*] ";
pub const WARN: &str = "[!] ";

/// Human readable size in powers of 1024
pub fn byte_count_binary(bytes: i64) -> String {
    const UNIT: i64 = 1024;
    if bytes < UNIT {
        return format!("{} B", bytes);
    }

    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT && exp < 5 {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }

    let suffix = ['K', 'M', 'G', 'T', 'P', 'E'][exp];
    format!("{:.1} {}iB", bytes as f64 / div as f64, suffix)
}

/// Left-aligned columns padded to the widest cell, with an underline row
pub fn table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(width) = widths.get_mut(i) {
                *width = (*width).max(cell.chars().count());
            }
        }
    }

    let render = |cells: Vec<String>| -> String {
        cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    let mut out = String::new();
    out.push_str(&render(headers.iter().map(|h| h.to_string()).collect()));
    out.push('\n');
    out.push_str(&render(headers.iter().map(|h| "=".repeat(h.len())).collect()));
    out.push('\n');
    for row in rows {
        out.push_str(&render(row.clone()));
        out.push('\n');
    }
    out
}

/// Session table; the active session is marked with `*`
pub fn sessions_table(sessions: &[SessionInfo], active: Option<u32>) -> String {
    let rows: Vec<Vec<String>> = sessions
        .iter()
        .map(|s| {
            let marker = if Some(s.id) == active { "*" } else { "" };
            vec![
                format!("{}{}", s.id, marker),
                s.name.clone(),
                s.transport.clone(),
                s.remote_address.clone(),
                s.hostname.clone(),
                s.username.clone(),
                format!("{}/{}", s.os, s.arch),
            ]
        })
        .collect();

    table(
        &[
            "ID",
            "Name",
            "Transport",
            "Remote Address",
            "Hostname",
            "Username",
            "Operating System",
        ],
        &rows,
    )
}

pub fn session_details(info: &SessionInfo) -> String {
    [
        ("ID", info.id.to_string()),
        ("Name", info.name.clone()),
        ("Hostname", info.hostname.clone()),
        ("Username", info.username.clone()),
        ("UID", info.uid.clone()),
        ("GID", info.gid.clone()),
        ("PID", info.pid.to_string()),
        ("OS", info.os.clone()),
        ("Arch", info.arch.clone()),
        ("Filename", info.filename.clone()),
        ("Transport", info.transport.clone()),
        ("Remote Address", info.remote_address.clone()),
        ("Connected", info.connected_at.format("%Y-%m-%d %H:%M:%S UTC").to_string()),
    ]
    .iter()
    .map(|(label, value)| format!("{:>15}: {}\n", label, value))
    .collect()
}

/// Process table; `own_pid` is the agent's own process and gets a `*`
pub fn process_table(processes: &[&Process], own_pid: i32) -> String {
    let mut out = format!("{:>6} | {:>6} | {}\n", "pid", "ppid", "executable");
    out.push_str(&"=".repeat(out.len() - 1));
    out.push('\n');

    for proc in processes {
        let marker = if proc.pid == own_pid { "*" } else { " " };
        out.push_str(&format!(
            "{:>6}{}| {:>6} | {}",
            proc.pid, marker, proc.ppid, proc.executable
        ));
        if !proc.owner.is_empty() {
            out.push_str(&format!(" ({})", proc.owner));
        }
        out.push('\n');
    }
    out
}

pub fn dir_listing(list: &DirList) -> String {
    let mut out = format!("{}\n{}\n", list.path, "=".repeat(list.path.chars().count()));

    let rows: Vec<Vec<String>> = list
        .files
        .iter()
        .map(|f| {
            let size = if f.is_dir {
                "<dir>".to_string()
            } else {
                byte_count_binary(f.size)
            };
            vec![f.name.clone(), size]
        })
        .collect();

    let width = rows.iter().map(|r| r[0].chars().count()).max().unwrap_or(0);
    for row in rows {
        out.push_str(&format!("{:<width$}  {}\n", row[0], row[1], width = width));
    }
    out
}

pub fn jobs_table(jobs: &[Job]) -> String {
    let rows: Vec<Vec<String>> = jobs
        .iter()
        .map(|j| {
            vec![
                j.id.to_string(),
                j.kind.to_string(),
                j.address(),
                j.profile.clone(),
                j.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            ]
        })
        .collect();

    table(&["ID", "Kind", "Address", "Profile", "Started"], &rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_proto::FileInfo;

    #[test]
    fn test_byte_count_binary() {
        assert_eq!(byte_count_binary(0), "0 B");
        assert_eq!(byte_count_binary(1023), "1023 B");
        assert_eq!(byte_count_binary(1024), "1.0 KiB");
        assert_eq!(byte_count_binary(1536), "1.5 KiB");
        assert_eq!(byte_count_binary(5 * 1024 * 1024), "5.0 MiB");
        assert_eq!(byte_count_binary(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }

    #[test]
    fn test_table_alignment() {
        let out = table(
            &["ID", "Name"],
            &[
                vec!["1".to_string(), "LONG_SESSION_NAME".to_string()],
                vec!["12".to_string(), "x".to_string()],
            ],
        );
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "ID  Name");
        assert_eq!(lines[1], "==  ====");
        assert_eq!(lines[2], "1   LONG_SESSION_NAME");
        assert_eq!(lines[3], "12  x");
    }

    #[test]
    fn test_process_table_marks_own_pid() {
        let procs = [
            Process {
                pid: 1,
                ppid: 0,
                executable: "init".to_string(),
                owner: String::new(),
            },
            Process {
                pid: 4242,
                ppid: 1,
                executable: "agent".to_string(),
                owner: "root".to_string(),
            },
        ];
        let refs: Vec<&Process> = procs.iter().collect();
        let out = process_table(&refs, 4242);

        assert!(out.contains("     1 |      0 | init\n"));
        assert!(out.contains("  4242*|      1 | agent (root)\n"));
    }

    #[test]
    fn test_dir_listing() {
        let out = dir_listing(&DirList {
            path: "/srv".to_string(),
            exists: true,
            files: vec![
                FileInfo {
                    name: "data".to_string(),
                    is_dir: true,
                    size: 4096,
                },
                FileInfo {
                    name: "a.log".to_string(),
                    is_dir: false,
                    size: 2048,
                },
            ],
        });

        assert!(out.starts_with("/srv\n====\n"));
        assert!(out.contains("data   <dir>\n"));
        assert!(out.contains("a.log  2.0 KiB\n"));
    }
}
