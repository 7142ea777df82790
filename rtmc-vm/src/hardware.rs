//! Simulated peripherals.
//!
//! Every peripheral keeps just enough state to be observable from test
//! code: pin levels, timer configuration, transmitted bytes. Reads of
//! floating inputs and ADC channels return random values in the right
//! range. Using a peripheral before initializing it is a runtime error.

use std::collections::HashMap;

use rand::Rng;

use crate::VmError;

#[derive(Debug, Clone, Copy)]
struct GpioPin {
    /// 0 = input, 1 = output.
    mode: i64,
    value: i64,
}

#[derive(Debug, Clone, Copy)]
struct Timer {
    mode: i64,
    frequency: i64,
    running: bool,
    pwm_duty: i64,
}

/// In-memory peripheral state shared by all tasks.
#[derive(Debug, Default)]
pub struct HardwareSimulator {
    gpio: HashMap<i64, GpioPin>,
    timers: HashMap<i64, Timer>,
    adc: HashMap<i64, i64>,
    uart_tx: Vec<Vec<u8>>,
    spi_tx: Vec<Vec<u8>>,
    i2c: HashMap<i64, HashMap<i64, i64>>,
}

impl HardwareSimulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gpio_init(&mut self, pin: i64, mode: i64) {
        self.gpio.insert(pin, GpioPin { mode, value: 0 });
        tracing::info!(pin, mode, "GPIO initialized");
    }

    pub fn gpio_set(&mut self, pin: i64, value: i64) -> Result<(), VmError> {
        let entry = self
            .gpio
            .get_mut(&pin)
            .ok_or(VmError::UninitializedPeripheral { kind: "GPIO", id: pin })?;
        if entry.mode != 1 {
            return Err(VmError::NotAnOutput { pin });
        }
        entry.value = value;
        tracing::info!(pin, value, "GPIO set");
        Ok(())
    }

    pub fn gpio_get(&mut self, pin: i64) -> Result<i64, VmError> {
        let entry = self
            .gpio
            .get_mut(&pin)
            .ok_or(VmError::UninitializedPeripheral { kind: "GPIO", id: pin })?;
        if entry.mode == 0 {
            // Floating input.
            entry.value = rand::thread_rng().gen_range(0..=1);
        }
        Ok(entry.value)
    }

    pub fn timer_init(&mut self, id: i64, mode: i64, frequency: i64) {
        self.timers.insert(
            id,
            Timer {
                mode,
                frequency,
                running: false,
                pwm_duty: 0,
            },
        );
        tracing::info!(id, mode, frequency, "timer initialized");
    }

    fn timer_mut(&mut self, id: i64) -> Result<&mut Timer, VmError> {
        self.timers
            .get_mut(&id)
            .ok_or(VmError::UninitializedPeripheral { kind: "timer", id })
    }

    pub fn timer_start(&mut self, id: i64) -> Result<(), VmError> {
        self.timer_mut(id)?.running = true;
        tracing::info!(id, "timer started");
        Ok(())
    }

    pub fn timer_stop(&mut self, id: i64) -> Result<(), VmError> {
        self.timer_mut(id)?.running = false;
        tracing::info!(id, "timer stopped");
        Ok(())
    }

    pub fn timer_set_pwm_duty(&mut self, id: i64, duty: i64) -> Result<(), VmError> {
        self.timer_mut(id)?.pwm_duty = duty;
        tracing::info!(id, duty, "PWM duty set");
        Ok(())
    }

    pub fn adc_init(&mut self, channel: i64) {
        self.adc.insert(channel, 0);
        tracing::info!(channel, "ADC initialized");
    }

    pub fn adc_read(&mut self, channel: i64) -> Result<i64, VmError> {
        let slot = self
            .adc
            .get_mut(&channel)
            .ok_or(VmError::UninitializedPeripheral { kind: "ADC", id: channel })?;
        // 12-bit conversion.
        *slot = rand::thread_rng().gen_range(0..4096);
        Ok(*slot)
    }

    pub fn uart_write(&mut self, data: Vec<u8>) {
        tracing::info!(bytes = data.len(), tx = %hex(&data), "UART TX");
        self.uart_tx.push(data);
    }

    /// Full-duplex transfer; the simulated peer answers `0xFF` per byte.
    pub fn spi_transfer(&mut self, tx: Vec<u8>) -> Vec<u8> {
        let rx = vec![0xFFu8; tx.len()];
        tracing::info!(tx = %hex(&tx), rx = %hex(&rx), "SPI transfer");
        self.spi_tx.push(tx);
        rx
    }

    pub fn i2c_write(&mut self, address: i64, data: i64) {
        tracing::info!(address, data, "I2C write");
        self.i2c.entry(address).or_default().insert(0, data);
    }

    pub fn i2c_read(&mut self, address: i64, register: i64) -> i64 {
        let value = self
            .i2c
            .entry(address)
            .or_default()
            .get(&register)
            .copied()
            .unwrap_or(0);
        tracing::info!(address, register, value, "I2C read");
        value
    }

    /// Observed output pin level, for assertions.
    pub fn gpio_level(&self, pin: i64) -> Option<i64> {
        self.gpio.get(&pin).map(|p| p.value)
    }

    /// Everything transmitted over UART so far.
    pub fn uart_frames(&self) -> &[Vec<u8>] {
        &self.uart_tx
    }

    /// Current PWM duty of a timer, for assertions.
    pub fn pwm_duty(&self, id: i64) -> Option<i64> {
        self.timers.get(&id).map(|t| t.pwm_duty)
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
