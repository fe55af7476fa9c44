pub mod afg;
pub mod galvo;
pub mod interface;
pub mod sim;

pub use afg::{shared_bus, AfgAsDac, AfgChannel, Arb, SharedBus};
pub use galvo::{shared, DacChannel, GalvoPixel, SharedPositioner};
pub use interface::{
    AnalogOutput, CountTask, DaqDriver, EdgeCounterConfig, Positioner, PulseTask, PulseTiming,
    SampleClock, VisaBus,
};
pub use sim::{SimulatedAfg, SimulatedDaq, TaskOp};
