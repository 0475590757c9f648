//! Serial port: a USART plus a transmit and a receive ring buffer.
//!
//! The hardware access is factored behind the small [`UsartBus`] trait so
//! that [`SerialPort`]'s pump routines can be exercised on the host with a
//! mock bus, keeping the ring-buffer bookkeeping testable independent of any
//! register access.

use crate::ring::RingBuffer;

/// The minimal USART surface `SerialPort` needs: status flags and the data
/// register. Implemented for the real peripheral on-target, and for a mock
/// in tests.
pub trait UsartBus {
    /// Transmit-data-register-empty: true when a new byte may be written.
    fn txe(&self) -> bool;
    /// Receive-data-register-not-empty: true when a received byte is ready.
    fn rxne(&self) -> bool;
    /// Writes a byte to the data register, starting its transmission.
    fn write_data(&self, byte: u8);
    /// Reads the received byte from the data register, clearing `rxne`.
    fn read_data(&self) -> u8;
}

pub struct SerialPort<'a, U> {
    usart: &'a U,
    tx: RingBuffer,
    rx: RingBuffer,
}

impl<'a, U: UsartBus> SerialPort<'a, U> {
    /// Constructs a serial port around `usart`, using `tx_region`/`rx_region`
    /// as the backing storage for the transmit/receive rings. `usart` must
    /// already have its line parameters (baud rate, 8N1) configured.
    pub fn init(
        usart: &'a U,
        tx_region: &'static mut [u8],
        rx_region: &'static mut [u8],
    ) -> Self {
        let mut tx = RingBuffer::EMPTY;
        tx.init(tx_region);
        let mut rx = RingBuffer::EMPTY;
        rx.init(rx_region);
        SerialPort { usart, tx, rx }
    }

    /// Enqueues to the transmit ring. Returns the number of bytes that fit.
    pub fn write(&self, src: &[u8]) -> usize {
        self.tx.write(src)
    }

    /// Dequeues from the receive ring. Returns the number of bytes read.
    pub fn read(&self, dst: &mut [u8]) -> usize {
        self.rx.read(dst)
    }

    /// Pumps the transmit ring into the USART while it is ready.
    ///
    /// Returns `true` iff the ring still holds bytes (the caller should keep
    /// transmit-ready interrupts enabled); `false` once the ring has been
    /// fully drained.
    pub fn transmit(&self) -> bool {
        let mut byte = 0u8;
        while !self.tx.is_empty() {
            if !self.usart.txe() {
                return true;
            }
            self.tx.read_byte(Some(&mut byte));
            self.usart.write_data(byte);
        }
        false
    }

    /// Pumps the USART into the receive ring while data is available.
    ///
    /// Returns `true` iff the USART has more data but the ring is full
    /// (signalling overrun risk to the caller); `false` once the USART has
    /// no more to offer.
    pub fn receive(&self) -> bool {
        while self.usart.rxne() {
            if self.rx.is_full() {
                return true;
            }
            self.rx.write_byte(self.usart.read_data());
        }
        false
    }

    /// Transmits `bytes` directly, bypassing the ring, blocking until each
    /// byte has been accepted by the USART.
    ///
    /// Used only during driver bring-up (power-up settle, init/config
    /// commands), before the interrupt-driven ring pump is meaningfully in
    /// the loop.
    pub fn transmit_blocking(&self, bytes: &[u8]) {
        for &b in bytes {
            while !self.usart.txe() {}
            self.usart.write_data(b);
        }
    }
}

#[cfg(target_os = "none")]
mod hw {
    use super::UsartBus;
    use stm32f1::stm32f103 as device;

    impl UsartBus for device::USART2 {
        fn txe(&self) -> bool {
            self.sr.read().txe().bit_is_set()
        }

        fn rxne(&self) -> bool {
            self.sr.read().rxne().bit_is_set()
        }

        fn write_data(&self, byte: u8) {
            self.dr.write(|w| w.dr().bits(byte as u16));
        }

        fn read_data(&self) -> u8 {
            self.dr.read().dr().bits() as u8
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    #[derive(Default)]
    struct MockUsart {
        txe: Cell<bool>,
        rxne: Cell<bool>,
        tx_log: core::cell::RefCell<alloc_free_vec::Vec>,
        rx_queue: core::cell::RefCell<alloc_free_vec::Vec>,
    }

    // A tiny fixed-capacity "vec" so the test module needs no allocator.
    mod alloc_free_vec {
        pub struct Vec {
            buf: [u8; 64],
            len: usize,
        }
        impl Vec {
            pub fn new() -> Self {
                Vec { buf: [0; 64], len: 0 }
            }
            pub fn push(&mut self, b: u8) {
                self.buf[self.len] = b;
                self.len += 1;
            }
            pub fn pop_front(&mut self) -> Option<u8> {
                if self.len == 0 {
                    return None;
                }
                let b = self.buf[0];
                self.buf.copy_within(1..self.len, 0);
                self.len -= 1;
                Some(b)
            }
            pub fn as_slice(&self) -> &[u8] {
                &self.buf[..self.len]
            }
        }
    }

    impl MockUsart {
        fn new() -> Self {
            MockUsart {
                txe: Cell::new(true),
                rxne: Cell::new(false),
                tx_log: core::cell::RefCell::new(alloc_free_vec::Vec::new()),
                rx_queue: core::cell::RefCell::new(alloc_free_vec::Vec::new()),
            }
        }

        fn push_rx(&self, byte: u8) {
            self.rx_queue.borrow_mut().push(byte);
            self.rxne.set(true);
        }
    }

    impl UsartBus for MockUsart {
        fn txe(&self) -> bool {
            self.txe.get()
        }
        fn rxne(&self) -> bool {
            self.rxne.get()
        }
        fn write_data(&self, byte: u8) {
            self.tx_log.borrow_mut().push(byte);
        }
        fn read_data(&self) -> u8 {
            let b = self.rx_queue.borrow_mut().pop_front().unwrap();
            if self.rx_queue.borrow().as_slice().is_empty() {
                self.rxne.set(false);
            }
            b
        }
    }

    #[test]
    fn transmit_drains_ring_while_txe() {
        static mut TX: [u8; 8] = [0; 8];
        static mut RX: [u8; 8] = [0; 8];
        let usart = MockUsart::new();
        let serial = SerialPort::init(&usart, unsafe { &mut TX }, unsafe { &mut RX });
        assert_eq!(serial.write(&[1, 2, 3]), 3);
        assert!(!serial.transmit());
        assert_eq!(usart.tx_log.borrow().as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn receive_fills_ring_and_reports_overrun() {
        static mut TX: [u8; 8] = [0; 8];
        static mut RX: [u8; 4] = [0; 4];
        let usart = MockUsart::new();
        let serial = SerialPort::init(&usart, unsafe { &mut TX }, unsafe { &mut RX });
        usart.push_rx(1);
        usart.push_rx(2);
        usart.push_rx(3);
        usart.push_rx(4);
        // ring capacity is 3 (len 4, one slot reserved); the 4th byte
        // overruns.
        assert!(serial.receive());
        let mut out = [0u8; 3];
        assert_eq!(serial.read(&mut out), 3);
        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn transmit_blocking_bypasses_ring() {
        static mut TX: [u8; 8] = [0; 8];
        static mut RX: [u8; 8] = [0; 8];
        let usart = MockUsart::new();
        let serial = SerialPort::init(&usart, unsafe { &mut TX }, unsafe { &mut RX });
        serial.transmit_blocking(&[0x1B, 0x40]);
        assert_eq!(usart.tx_log.borrow().as_slice(), &[0x1B, 0x40]);
        assert!(serial.tx.is_empty());
    }
}
