//! Capability filtering.
//!
//! A unit is only worth loading when every in-process function it marks as
//! required was resolved in the target. A missing offset map counts as an
//! empty one.

use std::collections::HashSet;

use super::Tracer;
use crate::inspect::Offsets;

/// First required in-process function of `unit` missing from `offsets`.
#[must_use]
pub fn missing_required(unit: &dyn Tracer, offsets: Option<&Offsets>) -> Option<&'static str> {
    unit.go_probes()
        .into_iter()
        .filter(|(_, programs)| programs.required)
        .map(|(function, _)| function)
        .find(|function| !offsets.is_some_and(|o| o.contains(function)))
}

/// Keep the units whose required in-process hooks are all resolved.
#[must_use]
pub fn filter_usable(units: Vec<Box<dyn Tracer>>, offsets: Option<&Offsets>) -> Vec<Box<dyn Tracer>> {
    units.into_iter().filter(|unit| missing_required(unit.as_ref(), offsets).is_none()).collect()
}

/// Every in-process function any unit hooks, deduplicated, in order of
/// first appearance. This is what the inspector is asked to resolve.
#[must_use]
pub fn all_go_function_names(units: &[Box<dyn Tracer>]) -> Vec<&'static str> {
    let mut seen = HashSet::new();
    units
        .iter()
        .flat_map(|unit| unit.go_probes())
        .map(|(function, _)| function)
        .filter(|function| seen.insert(*function))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::FuncOffsets;
    use crate::tracer::testing::FakeUnit;
    use crate::tracer::FunctionPrograms;

    fn offsets(names: &[&str]) -> Offsets {
        names.iter().map(|n| ((*n).to_string(), FuncOffsets::default())).collect()
    }

    fn units() -> Vec<Box<dyn Tracer>> {
        vec![
            Box::new(FakeUnit::new("http").with_go_probe("serve", FunctionPrograms::required("a", None))
                .with_go_probe("client", FunctionPrograms::optional("b", None))),
            Box::new(FakeUnit::new("grpc").with_go_probe("handle", FunctionPrograms::required("c", None))
                .with_go_probe("serve", FunctionPrograms::required("d", None))),
            Box::new(FakeUnit::new("generic").with_go_probe("client", FunctionPrograms::optional("e", None))),
            Box::new(FakeUnit::new("kernel-only")),
        ]
    }

    fn names(units: &[Box<dyn Tracer>]) -> Vec<&'static str> {
        units.iter().map(|u| u.name()).collect()
    }

    #[test]
    fn test_filter_requires_all_required_functions() {
        let usable = filter_usable(units(), Some(&offsets(&["serve"])));
        assert_eq!(names(&usable), vec!["http", "generic", "kernel-only"]);

        let usable = filter_usable(units(), Some(&offsets(&["serve", "handle"])));
        assert_eq!(names(&usable), vec!["http", "grpc", "generic", "kernel-only"]);
    }

    #[test]
    fn test_missing_offsets_keep_only_generic_units() {
        let usable = filter_usable(units(), None);
        assert_eq!(names(&usable), vec!["generic", "kernel-only"]);

        let usable = filter_usable(units(), Some(&Offsets::default()));
        assert_eq!(names(&usable), vec!["generic", "kernel-only"]);
    }

    #[test]
    fn test_missing_required_names_function() {
        let unit = FakeUnit::new("grpc")
            .with_go_probe("handle", FunctionPrograms::required("c", None))
            .with_go_probe("status", FunctionPrograms::required("d", None));
        assert_eq!(missing_required(&unit, Some(&offsets(&["handle"]))), Some("status"));
        assert_eq!(missing_required(&unit, Some(&offsets(&["handle", "status"]))), None);
    }

    #[test]
    fn test_function_names_deduplicated_in_order() {
        assert_eq!(all_go_function_names(&units()), vec!["serve", "client", "handle"]);
        assert!(all_go_function_names(&[]).is_empty());
    }
}
