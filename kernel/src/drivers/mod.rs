//! Legacy platform device drivers: the 8259 interrupt controllers, the
//! 8254 interval timer, the MC146818 real-time clock, and the PS/2
//! keyboard. Each driver programs its controller at init, registers a node
//! on its IRQ line, and acknowledges its own hardware before sending EOI.

pub mod keyboard;
pub mod pic;
pub mod pit;
pub mod rtc;
