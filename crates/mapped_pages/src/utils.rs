pub(crate) mod io;
pub(crate) mod units;

#[cfg(test)]
pub(crate) mod test_helpers {
	use std::{cell::RefCell, sync::Once};

	use log::{Level, LevelFilter, Log, Metadata, Record};

	/// Asserts that every byte of the given buffer is zero, reporting the first
	/// offending offset otherwise.
	macro_rules! assert_zeroed {
		($buf:expr $(,)?) => {
			$crate::utils::test_helpers::assert_zeroed!($buf, "")
		};
		($buf:expr, $($arg:tt)+) => {
			if let Some(pos) = $buf.iter().position(|byte| *byte != 0) {
				::core::panic!(
					"expected zeroed buffer, but found {:#04x} at offset {} {}",
					$buf[pos],
					pos,
					format_args!($($arg)+)
				);
			}
		};
	}
	pub(crate) use assert_zeroed;

	thread_local! {
		static RECORDS: RefCell<Vec<(Level, String)>> = const { RefCell::new(Vec::new()) };
	}

	/// Collects log records per thread, so tests running in parallel only see
	/// their own.
	struct ThreadLogger;

	impl Log for ThreadLogger {
		fn enabled(&self, _metadata: &Metadata) -> bool {
			true
		}

		fn log(&self, record: &Record) {
			RECORDS.with_borrow_mut(|records| {
				records.push((record.level(), record.args().to_string()))
			});
		}

		fn flush(&self) {}
	}

	static LOGGER: ThreadLogger = ThreadLogger;

	/// Starts collecting the current thread's log records, dropping earlier ones.
	pub(crate) fn capture_logs() {
		static INIT: Once = Once::new();
		INIT.call_once(|| {
			if log::set_logger(&LOGGER).is_ok() {
				log::set_max_level(LevelFilter::Trace);
			}
		});
		RECORDS.with_borrow_mut(Vec::clear);
	}

	/// Messages logged on the current thread at `level` since the last
	/// [`capture_logs`].
	pub(crate) fn logged(level: Level) -> Vec<String> {
		RECORDS.with_borrow(|records| {
			records
				.iter()
				.filter(|(record_level, _)| *record_level == level)
				.map(|(_, message)| message.clone())
				.collect()
		})
	}
}
