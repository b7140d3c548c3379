#![allow(non_upper_case_globals)]

pub const B: u64 = 1;
pub const KiB: u64 = 1024 * B;
pub const MiB: u64 = 1024 * KiB;
pub const GiB: u64 = 1024 * MiB;
pub const TiB: u64 = 1024 * GiB;

const UNITS: [(&str, u64); 5] = [("B", B), ("KiB", KiB), ("MiB", MiB), ("GiB", GiB), ("TiB", TiB)];

/// Formats a byte count with the largest binary unit it reaches, e.g.
/// `4 KiB` or `1.50 MiB`.
pub fn display_size(bytes: u64) -> String {
	let Some((name, unit)) = UNITS.iter().rev().find(|(_, unit)| bytes >= *unit) else {
		return String::from("0 B");
	};
	if bytes % unit == 0 {
		return format!("{} {name}", bytes / unit);
	}
	format!("{:.2} {name}", bytes as f64 / *unit as f64)
}
