//! Advertisement admission predicates.

use crate::api::ScanFilter;
use uuid::Uuid;

/// Decides whether an advertisement passes `filter`.
///
/// A missing name never satisfies a name or prefix filter. Service filtering is not part of this
/// check; see [`admits_services`].
pub fn admit(name: Option<&str>, filter: &ScanFilter, is_duplicate: bool) -> bool {
    if is_duplicate && !filter.allow_duplicates {
        return false;
    }
    if let Some(exact) = &filter.name {
        if name != Some(exact.as_str()) {
            return false;
        }
    }
    if let Some(prefix) = &filter.name_prefix {
        match name {
            Some(name) if name.starts_with(prefix.as_str()) => {}
            _ => return false,
        }
    }
    true
}

/// Service check for drivers that cannot filter by service themselves: an empty filter admits
/// everything, otherwise at least one advertised service has to be listed.
pub fn admits_services(advertised: &[Uuid], filter: &ScanFilter) -> bool {
    filter.services.is_empty() || advertised.iter().any(|uuid| filter.services.contains(uuid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::bleuuid::uuid_from_u16;

    fn prefix(p: &str) -> ScanFilter {
        ScanFilter {
            name_prefix: Some(p.into()),
            ..Default::default()
        }
    }

    #[test]
    fn empty_filter_admits_first_sighting_only() {
        let filter = ScanFilter::default();
        assert!(admit(None, &filter, false));
        assert!(admit(Some("x"), &filter, false));
        assert!(!admit(Some("x"), &filter, true));
    }

    #[test]
    fn duplicates_pass_when_allowed() {
        let filter = ScanFilter {
            allow_duplicates: true,
            ..Default::default()
        };
        assert!(admit(Some("x"), &filter, true));
    }

    #[test]
    fn prefix_filter() {
        let filter = prefix("Foo");
        assert!(admit(Some("FooBar"), &filter, false));
        assert!(admit(Some("Foo"), &filter, false));
        assert!(!admit(Some("Bar"), &filter, false));
        assert!(!admit(Some("foobar"), &filter, false));
        assert!(!admit(None, &filter, false));
    }

    #[test]
    fn exact_name_filter() {
        let filter = ScanFilter {
            name: Some("Tag".into()),
            ..Default::default()
        };
        assert!(admit(Some("Tag"), &filter, false));
        assert!(!admit(Some("Tag2"), &filter, false));
        assert!(!admit(None, &filter, false));
    }

    #[test]
    fn name_and_prefix_must_both_hold() {
        let filter = ScanFilter {
            name: Some("FooBar".into()),
            name_prefix: Some("Foo".into()),
            ..Default::default()
        };
        assert!(admit(Some("FooBar"), &filter, false));
        assert!(!admit(Some("FooBaz"), &filter, false));
    }

    #[test]
    fn service_intersection() {
        let battery = uuid_from_u16(0x180f);
        let heart_rate = uuid_from_u16(0x180d);
        let filter = ScanFilter {
            services: vec![heart_rate],
            ..Default::default()
        };
        assert!(admits_services(&[battery, heart_rate], &filter));
        assert!(!admits_services(&[battery], &filter));
        assert!(!admits_services(&[], &filter));
        assert!(admits_services(&[], &ScanFilter::default()));
    }
}
