//! `log` facade backend.
//!
//! All kernel output goes through `log::...!` macros; this backend renders
//! them on the serial port. On non-i686 builds records are dropped, which
//! keeps unit tests quiet.

use conquer_once::spin::OnceCell;
use log::{LevelFilter, Log, Metadata, Record};

struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        #[cfg(target_arch = "x86")]
        crate::serial::write_fmt(format_args!(
            "[{:5}] {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        ));
        #[cfg(not(target_arch = "x86"))]
        let _ = record;
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;
static INITIALIZED: OnceCell<()> = OnceCell::uninit();

pub fn init() {
    INITIALIZED.init_once(|| {
        #[cfg(target_arch = "x86")]
        crate::serial::init();
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(LevelFilter::Info);
        }
    });
}
