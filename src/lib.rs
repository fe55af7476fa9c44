pub mod config;
pub mod counter;
pub mod error;
pub mod fast;
pub mod frame;
pub mod hardware;
pub mod monitor;
pub mod pixel_stream;
pub mod plotting;
pub mod record;
pub mod scan;
pub mod source;
pub mod types;
pub mod worker;

pub use config::{load_config, load_config_or_default, AppConfig};
pub use counter::{count_rate, BufferedHandle, CounterHandle, GatedCounter};
pub use error::ScanError;
pub use fast::{
    decode_image, load_waveforms, make_waveforms, FastSetup, FrameBurstStream, RowBurstStream,
    Waveforms,
};
pub use frame::{
    cell_for_index, AssemblyMode, Chunked, Frame, FrameAssembler, FrameUpdate, Measurement,
    SharedFrame,
};
pub use hardware::{
    AfgAsDac, AfgChannel, Arb, DaqDriver, GalvoPixel, Positioner, SharedBus, SharedPositioner,
    SimulatedAfg, SimulatedDaq, VisaBus,
};
pub use monitor::{RateHistory, RateMonitor, RateSample};
pub use pixel_stream::PixelStream;
pub use plotting::{frame_to_ascii, plot_values};
pub use record::{next_filename, save_png, FrameRecord};
pub use scan::{ScanMode, ScanSession};
pub use source::RasterPositions;
pub use types::{format_hms, Position, ScanAxis, ScanPlan, ScanState};
pub use worker::{AcquisitionWorker, ManualPositioner, ScanEvent, ScanOutcome, SharedState};
