use crate::fitting::common::error::{FitError, FittingResult};
use crate::ports::{Port, PortKind};
use indexmap::IndexMap;
use rayon::prelude::*;

/// A resonator and the ports it was measured through, in insertion order.
#[derive(Debug, Default)]
pub struct Resonator {
    pub comment: String,
    ports: IndexMap<String, Port>,
}

impl Resonator {
    /// Creates a resonator from `(name, tag)` pairs, see `PortKind` for the tags.
    ///
    /// # Errors
    /// Will return `Err(FitError::UnsupportedPortType)` for an unknown tag.
    pub fn new(comment: &str, ports: &[(&str, &str)]) -> FittingResult<Resonator> {
        let mut resonator = Resonator {
            comment: comment.to_string(),
            ports: IndexMap::new(),
        };
        for (name, tag) in ports {
            resonator.add_port(name, tag.parse()?);
        }
        if resonator.ports.is_empty() {
            tracing::warn!(comment, "resonator has no ports");
        }
        Ok(resonator)
    }

    /// Adds an empty port, replacing any port of the same name.
    pub fn add_port(&mut self, name: &str, kind: PortKind) -> &mut Port {
        if self.ports.contains_key(name) {
            tracing::warn!(name, "replacing existing port");
        }
        self.ports.insert(name.to_string(), Port::new(kind));
        &mut self.ports[name]
    }

    pub fn delete_port(&mut self, name: &str) -> Option<Port> {
        self.ports.shift_remove(name)
    }

    pub fn port(&self, name: &str) -> Option<&Port> {
        self.ports.get(name)
    }

    pub fn port_mut(&mut self, name: &str) -> Option<&mut Port> {
        self.ports.get_mut(name)
    }

    pub fn ports(&self) -> impl Iterator<Item = (&String, &Port)> {
        self.ports.iter()
    }

    /// Adds a transmission port between two existing ports, named `"p1 -> p2"`.
    ///
    /// # Errors
    /// Will return `Err(FitError::InvalidInput)` if either port does not exist.
    pub fn add_transmission_measurement(&mut self, port1: &str, port2: &str) -> FittingResult<&mut Port> {
        for name in [port1, port2] {
            if !self.ports.contains_key(name) {
                Err(FitError::InvalidInput(format!("no port named '{name}'")))?
            }
        }
        Ok(self.add_port(&format!("{port1} -> {port2}"), PortKind::Transmission))
    }

    /// Fits every port that holds data.
    ///
    /// # Errors
    /// Will return the first fit error encountered.
    pub fn fit_all(&mut self) -> FittingResult<()> {
        self.ports
            .values_mut()
            .filter(|port| port.has_data())
            .try_for_each(Port::autofit)
    }

    /// Fits every port that holds data in parallel.
    ///
    /// # Errors
    /// Will return a fit error if any port fails.
    pub fn par_fit_all(&mut self) -> FittingResult<()> {
        self.ports
            .values_mut()
            .filter(|port| port.has_data())
            .collect::<Vec<&mut Port>>()
            .into_par_iter()
            .try_for_each(Port::autofit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_are_parsed_from_tags() {
        let resonator = Resonator::new("test", &[("p1", "direct"), ("p2", "notch")]).unwrap();
        assert_eq!(resonator.port("p1").map(Port::kind), Some(PortKind::Reflection));
        assert_eq!(resonator.port("p2").map(Port::kind), Some(PortKind::Notch));
        assert!(matches!(
            Resonator::new("test", &[("p1", "lowpass")]),
            Err(FitError::UnsupportedPortType(_))
        ));
    }

    #[test]
    fn transmission_needs_both_ports() {
        let mut resonator = Resonator::new("test", &[("p1", "direct"), ("p2", "direct")]).unwrap();
        assert!(resonator.add_transmission_measurement("p1", "p3").is_err());
        resonator.add_transmission_measurement("p1", "p2").unwrap();
        assert_eq!(
            resonator.port("p1 -> p2").map(Port::kind),
            Some(PortKind::Transmission)
        );
        assert!(resonator.delete_port("p1 -> p2").is_some());
        assert!(resonator.port("p1 -> p2").is_none());
    }

    #[test]
    fn empty_ports_are_skipped() {
        let mut resonator = Resonator::new("", &[("p1", "notch")]).unwrap();
        assert!(resonator.fit_all().is_ok());
        assert!(resonator.par_fit_all().is_ok());
        assert!(resonator.port("p1").and_then(Port::fit).is_none());
    }
}
