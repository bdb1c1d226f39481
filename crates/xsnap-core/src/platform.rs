//! Timers and promise jobs
//!
//! Both queues are heap instances under stack roots, so pending work is part
//! of every snapshot. A timer record is a plain instance with `id`,
//! `callback`, `argument`, `interval`, `when` and `repeat` properties; `when`
//! is wall-clock milliseconds, which keeps deadlines meaningful after a
//! machine is resumed in another process.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{MachineError, MachineResult};
use crate::machine::{Machine, Root};
use crate::slot::{KeyId, SlotFlags, SlotRef, Value};

/// Wall-clock time in milliseconds
pub fn now_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

/// A pending timer
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Timer {
    /// Timer ID
    pub id: u32,
    /// Function to call
    pub callback: Value,
    /// Argument passed to the callback
    pub argument: Value,
    /// Interval in milliseconds
    pub interval: f64,
    /// Deadline in wall-clock milliseconds
    pub when: f64,
    /// Fire again after each interval
    pub repeat: bool,
    record: SlotRef,
}

impl Machine {
    pub(crate) fn new_queue(&mut self) -> MachineResult<SlotRef> {
        self.new_instance(
            None,
            &[Value::Array {
                address: None,
                length: 0,
            }],
        )
    }

    /// Schedule `callback(argument)` after `interval` milliseconds
    pub fn set_timer(
        &mut self,
        callback: Value,
        argument: Value,
        interval: f64,
        repeat: bool,
    ) -> MachineResult<u32> {
        if !self.is_callable(callback) {
            return Err(MachineError::type_error("timer callback is not a function"));
        }
        let interval = if interval.is_finite() { interval.max(0.0) } else { 0.0 };
        let timers = self.root_instance(Root::Timers)?;
        let id = match self.get_own_value(timers, KeyId::ID) {
            Some(Value::Integer(id)) if id > 0 => id,
            _ => 1,
        };
        self.set(timers, KeyId::ID, Value::Integer(id + 1))?;

        let record = self.new_object(None)?;
        for (key, value) in [
            (KeyId::ID, Value::Integer(id)),
            (KeyId::CALLBACK, callback),
            (KeyId::ARGUMENT, argument),
            (KeyId::INTERVAL, Value::Number(interval)),
            (KeyId::WHEN, Value::Number(now_ms() + interval)),
            (KeyId::REPEAT, Value::Boolean(repeat)),
        ] {
            self.define(record, key, value, SlotFlags::empty())?;
        }
        self.push_item(timers, Value::Reference(record))?;
        tracing::trace!(id, interval, repeat, "timer set");
        Ok(id as u32)
    }

    /// Cancel a timer. `false` if no such timer is pending.
    pub fn clear_timer(&mut self, id: u32) -> MachineResult<bool> {
        let timers = self.root_instance(Root::Timers)?;
        let position = self.timers()?.iter().position(|timer| timer.id == id);
        match position {
            Some(index) => {
                self.remove_item(timers, index as u32)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Pending timers, in scheduling order
    pub fn timers(&self) -> MachineResult<Vec<Timer>> {
        let timers = self.root_instance(Root::Timers)?;
        self.array_items(timers)?
            .into_iter()
            .map(|item| {
                let record = item
                    .as_reference()
                    .ok_or_else(|| MachineError::unknown("damaged timer queue"))?;
                self.timer(record)
            })
            .collect()
    }

    fn timer(&self, record: SlotRef) -> MachineResult<Timer> {
        let field = |key| self.get_own_value(record, key).unwrap_or(Value::Undefined);
        let id = match field(KeyId::ID) {
            Value::Integer(id) if id > 0 => id as u32,
            _ => return Err(MachineError::unknown("damaged timer record")),
        };
        Ok(Timer {
            id,
            callback: field(KeyId::CALLBACK),
            argument: field(KeyId::ARGUMENT),
            interval: field(KeyId::INTERVAL).as_number().unwrap_or(0.0),
            when: field(KeyId::WHEN).as_number().unwrap_or(0.0),
            repeat: field(KeyId::REPEAT).is_truthy(),
            record,
        })
    }

    /// Queue a promise job
    pub fn enqueue_job(&mut self, callback: Value, argument: Value) -> MachineResult<()> {
        if !self.is_callable(callback) {
            return Err(MachineError::type_error("job is not a function"));
        }
        let jobs = self.root_instance(Root::Jobs)?;
        let record = self.new_object(None)?;
        self.define(record, KeyId::CALLBACK, callback, SlotFlags::empty())?;
        self.define(record, KeyId::ARGUMENT, argument, SlotFlags::empty())?;
        self.push_item(jobs, Value::Reference(record))?;
        Ok(())
    }

    /// Number of queued promise jobs
    pub fn pending_jobs(&self) -> MachineResult<u32> {
        self.array_length(self.root_instance(Root::Jobs)?)
    }

    /// Run promise jobs until the queue is empty, including jobs queued by
    /// jobs. Returns how many ran.
    pub fn run_jobs(&mut self) -> MachineResult<usize> {
        let jobs = self.root_instance(Root::Jobs)?;
        let mut count = 0;
        loop {
            let batch = self.take_items(jobs)?;
            if batch.is_empty() {
                return Ok(count);
            }
            for job in batch {
                let Some(record) = job.as_reference() else {
                    continue;
                };
                let callback = self.get_own_value(record, KeyId::CALLBACK).unwrap_or(Value::Undefined);
                let argument = self.get_own_value(record, KeyId::ARGUMENT).unwrap_or(Value::Undefined);
                self.call(callback, Value::Undefined, &[argument])?;
                count += 1;
            }
        }
    }

    /// Run jobs, then fire at most one due timer. Returns `Some(delay)` with
    /// the milliseconds until the next timer, `None` when nothing is pending.
    pub fn run_turn(&mut self) -> MachineResult<Option<f64>> {
        self.run_jobs()?;
        let Some(timer) = self
            .timers()?
            .into_iter()
            .min_by(|a, b| a.when.total_cmp(&b.when))
        else {
            return Ok(None);
        };
        let now = now_ms();
        if timer.when > now {
            return Ok(Some(timer.when - now));
        }
        let timers = self.root_instance(Root::Timers)?;
        if timer.repeat {
            let when = (timer.when + timer.interval).max(now);
            self.define(timer.record, KeyId::WHEN, Value::Number(when), SlotFlags::empty())?;
        } else if let Some(index) = self.timers()?.iter().position(|t| t.id == timer.id) {
            self.remove_item(timers, index as u32)?;
        }
        tracing::trace!(id = timer.id, "timer fired");
        self.call(timer.callback, Value::Undefined, &[timer.argument])?;
        self.run_jobs()?;
        Ok(Some(0.0))
    }

    /// Run jobs and timers until nothing is pending
    pub fn run_loop(&mut self) -> MachineResult<()> {
        while let Some(delay) = self.run_turn()? {
            if delay > 0.0 {
                std::thread::sleep(Duration::from_secs_f64(delay / 1000.0));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::CallFrame;
    use crate::creation::Creation;

    fn record(machine: &mut Machine, frame: &CallFrame<'_>) -> MachineResult<Value> {
        let global = machine.global()?;
        let key = machine.intern("fired")?;
        let count = match machine.get(global, key)? {
            Value::Integer(n) => n,
            _ => 0,
        };
        machine.set(global, key, Value::Integer(count + 1))?;
        let last = machine.intern("last")?;
        machine.set(global, last, frame.arg(0))?;
        Ok(Value::Undefined)
    }

    fn fired(machine: &mut Machine) -> Value {
        let global = machine.global().unwrap();
        let key = machine.intern("fired").unwrap();
        machine.get(global, key).unwrap()
    }

    #[test]
    fn test_one_shot_timer_fires_once() {
        let mut machine = Machine::new(Creation::small()).unwrap();
        let function = machine.new_function(record, "record", 1).unwrap();
        let id = machine
            .set_timer(Value::Reference(function), Value::Integer(7), 0.0, false)
            .unwrap();
        assert_eq!(id, 1);
        assert_eq!(machine.timers().unwrap().len(), 1);
        machine.run_loop().unwrap();
        assert_eq!(fired(&mut machine), Value::Integer(1));
        assert!(machine.timers().unwrap().is_empty());
    }

    #[test]
    fn test_clear_timer() {
        let mut machine = Machine::new(Creation::small()).unwrap();
        let function = machine.new_function(record, "record", 1).unwrap();
        let a = machine
            .set_timer(Value::Reference(function), Value::Null, 0.0, false)
            .unwrap();
        let b = machine
            .set_timer(Value::Reference(function), Value::Null, 0.0, false)
            .unwrap();
        assert_ne!(a, b);
        assert!(machine.clear_timer(a).unwrap());
        assert!(!machine.clear_timer(a).unwrap());
        machine.run_loop().unwrap();
        assert_eq!(fired(&mut machine), Value::Integer(1));
    }

    #[test]
    fn test_jobs_drain_in_order() {
        let mut machine = Machine::new(Creation::small()).unwrap();
        let function = machine.new_function(record, "record", 1).unwrap();
        machine
            .enqueue_job(Value::Reference(function), Value::Integer(1))
            .unwrap();
        machine
            .enqueue_job(Value::Reference(function), Value::Integer(2))
            .unwrap();
        assert_eq!(machine.pending_jobs().unwrap(), 2);
        assert_eq!(machine.run_jobs().unwrap(), 2);
        let global = machine.global().unwrap();
        let last = machine.intern("last").unwrap();
        assert_eq!(machine.get(global, last).unwrap(), Value::Integer(2));
        assert_eq!(machine.pending_jobs().unwrap(), 0);
    }

    #[test]
    fn test_timer_needs_a_function() {
        let mut machine = Machine::new(Creation::small()).unwrap();
        assert!(machine
            .set_timer(Value::Integer(1), Value::Null, 0.0, false)
            .unwrap_err()
            .is_type_error());
    }
}
