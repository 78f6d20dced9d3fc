//! Event-to-state reconciliation.
//!
//! Each view holds a snapshot obtained over REST and keeps it fresh by folding
//! server-pushed events into it, without re-fetching per event. Three view
//! kinds exist: the capacity-bounded incident queue, the id-keyed unit board
//! and a single-incident watch for the detail view.
//!
//! Merge rules are shallow: fields present in a patch overwrite, absent fields
//! are preserved. A patch for an id outside the view is ignored. When a patch
//! carries a sequence number, updates older than the one already held for that
//! entity are rejected; patches without one apply in arrival order, which the
//! snapshot-replace-on-refresh behavior keeps tolerable.

use std::collections::HashMap;

use log::debug;

use crate::events::{IncidentCreated, IncidentPatched, OpsEvent, UnitPatched};
use crate::types::{Incident, IncidentStatus, Unit};

/// A freshly created incident without an explicit priority is displayed as
/// lowest priority rather than unknown
const DEFAULT_PRIORITY: u8 = 1;

/// Capacity-bounded, newest-first incident list with an optional status filter
#[derive(Debug)]
pub struct IncidentQueue {
    capacity: usize,
    filter: Option<Vec<IncidentStatus>>,
    incidents: Vec<Incident>,
    seqs: HashMap<String, u64>,
}

impl IncidentQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            filter: None,
            incidents: Vec::new(),
            seqs: HashMap::new(),
        }
    }

    /// Restrict the view to the given statuses. An update moving an incident
    /// outside this window removes it from the view even though it still
    /// exists server-side.
    pub fn with_filter(mut self, statuses: impl Into<Vec<IncidentStatus>>) -> Self {
        self.filter = Some(statuses.into());
        self
    }

    pub fn incidents(&self) -> &[Incident] {
        &self.incidents
    }

    pub fn len(&self) -> usize {
        self.incidents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.incidents.is_empty()
    }

    /// Replace the whole view with a fresh snapshot. Not a merge: any local
    /// state that drifted from the server is wiped here.
    pub fn replace_snapshot(&mut self, incidents: Vec<Incident>) {
        self.seqs.clear();
        self.incidents = match &self.filter {
            Some(filter) => incidents
                .into_iter()
                .filter(|i| filter.contains(&i.status))
                .collect(),
            None => incidents,
        };
        self.incidents.truncate(self.capacity);
    }

    /// Fold one event into the view. Returns true if the view changed.
    pub fn apply(&mut self, event: &OpsEvent) -> bool {
        match event {
            OpsEvent::IncidentNew(created) => self.apply_created(created),
            OpsEvent::IncidentPatched(patched) => self.apply_patch(patched),
            OpsEvent::UnitPatched(_) | OpsEvent::Geo(_) => false,
        }
    }

    fn apply_created(&mut self, created: &IncidentCreated) -> bool {
        if self
            .filter
            .as_ref()
            .is_some_and(|f| !f.contains(&created.status))
        {
            return false;
        }

        if let Some(seq) = created.seq {
            self.seqs.insert(created.id.clone(), seq);
        }

        self.incidents.insert(
            0,
            Incident {
                id: created.id.clone(),
                status: created.status,
                created_at: created.created_at,
                lat: created.lat,
                lng: created.lng,
                accuracy: None,
                priority: Some(created.priority.unwrap_or(DEFAULT_PRIORITY)),
                battery: None,
            },
        );
        self.incidents.truncate(self.capacity);
        true
    }

    fn apply_patch(&mut self, patched: &IncidentPatched) -> bool {
        let Some(index) = self.incidents.iter().position(|i| i.id == patched.id) else {
            // Outside the current view's window; the entity still exists
            // server-side but is not ours to track
            return false;
        };

        if self.is_stale(&patched.id, patched.seq) {
            debug!("rejecting stale patch for incident {}", patched.id);
            return false;
        }

        let incident = &mut self.incidents[index];
        if let Some(status) = patched.patch.status {
            incident.status = status;
        }
        if let Some(location) = patched.patch.location {
            incident.lat = location.lat;
            incident.lng = location.lng;
            if location.accuracy.is_some() {
                incident.accuracy = location.accuracy;
            }
        }

        if self
            .filter
            .as_ref()
            .is_some_and(|f| !f.contains(&self.incidents[index].status))
        {
            self.incidents.remove(index);
            self.seqs.remove(&patched.id);
            return true;
        }

        if let Some(seq) = patched.seq {
            self.seqs.insert(patched.id.clone(), seq);
        }
        true
    }

    fn is_stale(&self, id: &str, seq: Option<u64>) -> bool {
        match (seq, self.seqs.get(id)) {
            (Some(new), Some(held)) => new < *held,
            _ => false,
        }
    }
}

/// Id-keyed unit state, as used by the live map and the unit status displays
#[derive(Debug, Default)]
pub struct UnitBoard {
    units: HashMap<i64, Unit>,
    seqs: HashMap<i64, u64>,
}

impl UnitBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: i64) -> Option<&Unit> {
        self.units.get(&id)
    }

    pub fn units(&self) -> impl Iterator<Item = &Unit> {
        self.units.values()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn replace_snapshot(&mut self, units: Vec<Unit>) {
        self.seqs.clear();
        self.units = units.into_iter().map(|u| (u.id, u)).collect();
    }

    /// Fold one event into the board. Returns true if the board changed.
    pub fn apply(&mut self, event: &OpsEvent) -> bool {
        let OpsEvent::UnitPatched(patched) = event else {
            return false;
        };
        self.apply_patch(patched)
    }

    fn apply_patch(&mut self, patched: &UnitPatched) -> bool {
        let Some(unit) = self.units.get_mut(&patched.id) else {
            return false;
        };

        if let (Some(new), Some(held)) = (patched.seq, self.seqs.get(&patched.id))
            && new < *held
        {
            debug!("rejecting stale patch for unit {}", patched.id);
            return false;
        }

        if let Some(status) = patched.status {
            unit.status = status;
        }
        if let Some(lat) = patched.lat {
            unit.lat = Some(lat);
        }
        if let Some(lng) = patched.lng {
            unit.lng = Some(lng);
        }
        if let Some(last_seen) = patched.last_seen {
            unit.last_seen = Some(last_seen);
        }
        if let Some(seq) = patched.seq {
            self.seqs.insert(patched.id, seq);
        }
        true
    }
}

/// Dirtiness tracker for a single incident's detail view.
///
/// The detail endpoint returns nested collections (assignments, timeline)
/// that patch events only hint at, so any patch for the watched id flags the
/// view dirty and the caller refetches the full detail.
#[derive(Debug)]
pub struct IncidentWatch {
    id: String,
    dirty: bool,
}

impl IncidentWatch {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            dirty: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns true if the event concerns the watched incident
    pub fn apply(&mut self, event: &OpsEvent) -> bool {
        if let OpsEvent::IncidentPatched(patched) = event
            && patched.id == self.id
        {
            self.dirty = true;
            return true;
        }
        false
    }

    /// Consume the dirty flag; the caller refetches when this returns true
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{IncidentPatch, UnitPatched};
    use crate::types::{Location, UnitStatus, UnitType};
    use chrono::{TimeZone, Utc};

    fn incident(id: &str, status: IncidentStatus) -> Incident {
        Incident {
            id: id.to_string(),
            status,
            created_at: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
            lat: 14.6349,
            lng: -90.5069,
            accuracy: Some(12.0),
            priority: Some(2),
            battery: Some(80),
        }
    }

    fn patch_event(id: &str, patch: IncidentPatch, seq: Option<u64>) -> OpsEvent {
        OpsEvent::IncidentPatched(IncidentPatched {
            id: id.to_string(),
            patch,
            seq,
        })
    }

    fn status_patch(id: &str, status: IncidentStatus) -> OpsEvent {
        patch_event(
            id,
            IncidentPatch {
                status: Some(status),
                ..Default::default()
            },
            None,
        )
    }

    fn created_event(id: &str) -> OpsEvent {
        OpsEvent::IncidentNew(IncidentCreated {
            id: id.to_string(),
            lat: 14.0,
            lng: -90.0,
            created_at: Utc.with_ymd_and_hms(2025, 3, 1, 13, 0, 0).unwrap(),
            status: IncidentStatus::New,
            priority: None,
            seq: None,
        })
    }

    #[test]
    fn patches_shallow_merge_in_arrival_order() {
        let mut queue = IncidentQueue::new(10);
        queue.replace_snapshot(vec![
            incident("A", IncidentStatus::New),
            incident("B", IncidentStatus::Ack),
        ]);

        assert!(queue.apply(&status_patch("A", IncidentStatus::Dispatched)));
        assert!(queue.apply(&patch_event(
            "A",
            IncidentPatch {
                location: Some(Location {
                    lat: 15.0,
                    lng: -91.0,
                    accuracy: None,
                }),
                ..Default::default()
            },
            None,
        )));

        let a = &queue.incidents()[0];
        assert_eq!(a.id, "A");
        assert_eq!(a.status, IncidentStatus::Dispatched);
        assert_eq!(a.lat, 15.0);
        assert_eq!(a.lng, -91.0);
        // Fields never present in any patch keep their snapshot values
        assert_eq!(a.priority, Some(2));
        assert_eq!(a.battery, Some(80));
        assert_eq!(a.accuracy, Some(12.0));
        assert_eq!(queue.incidents()[1].status, IncidentStatus::Ack);
    }

    #[test]
    fn unknown_id_patch_is_a_no_op() {
        let mut queue = IncidentQueue::new(10);
        queue.replace_snapshot(vec![incident("A", IncidentStatus::New)]);
        let before = queue.incidents().to_vec();

        assert!(!queue.apply(&status_patch("Z", IncidentStatus::Closed)));
        assert_eq!(queue.incidents(), &before[..]);
    }

    #[test]
    fn created_at_capacity_evicts_oldest() {
        let mut queue = IncidentQueue::new(3);
        queue.replace_snapshot(vec![
            incident("A", IncidentStatus::New),
            incident("B", IncidentStatus::New),
            incident("C", IncidentStatus::New),
        ]);

        assert!(queue.apply(&created_event("D")));

        let ids: Vec<&str> = queue.incidents().iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["D", "A", "B"]);
    }

    #[test]
    fn created_without_priority_defaults_to_one() {
        let mut queue = IncidentQueue::new(10);
        queue.apply(&created_event("A"));
        assert_eq!(queue.incidents()[0].priority, Some(1));
    }

    #[test]
    fn status_leaving_filter_removes_only_that_incident() {
        let mut queue = IncidentQueue::new(10).with_filter(vec![IncidentStatus::New]);
        queue.replace_snapshot(vec![
            incident("A", IncidentStatus::New),
            incident("B", IncidentStatus::New),
        ]);

        assert!(queue.apply(&status_patch("A", IncidentStatus::Dispatched)));

        let ids: Vec<&str> = queue.incidents().iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["B"]);
    }

    #[test]
    fn filtered_snapshot_drops_out_of_window_entries() {
        let mut queue = IncidentQueue::new(10).with_filter(vec![IncidentStatus::New]);
        queue.replace_snapshot(vec![
            incident("A", IncidentStatus::New),
            incident("B", IncidentStatus::Closed),
        ]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn snapshot_replaces_rather_than_merges() {
        let mut queue = IncidentQueue::new(10);
        queue.replace_snapshot(vec![incident("A", IncidentStatus::New)]);
        queue.apply(&status_patch("A", IncidentStatus::Dispatched));

        queue.replace_snapshot(vec![incident("B", IncidentStatus::Ack)]);

        let ids: Vec<&str> = queue.incidents().iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["B"]);
    }

    #[test]
    fn stale_seq_patch_is_rejected() {
        let mut queue = IncidentQueue::new(10);
        queue.replace_snapshot(vec![incident("A", IncidentStatus::New)]);

        assert!(queue.apply(&patch_event(
            "A",
            IncidentPatch {
                status: Some(IncidentStatus::Dispatched),
                ..Default::default()
            },
            Some(5),
        )));
        // Arrives late with an older sequence number
        assert!(!queue.apply(&patch_event(
            "A",
            IncidentPatch {
                status: Some(IncidentStatus::Ack),
                ..Default::default()
            },
            Some(3),
        )));

        assert_eq!(queue.incidents()[0].status, IncidentStatus::Dispatched);
    }

    #[test]
    fn unsequenced_patches_apply_in_arrival_order() {
        let mut queue = IncidentQueue::new(10);
        queue.replace_snapshot(vec![incident("A", IncidentStatus::New)]);

        queue.apply(&status_patch("A", IncidentStatus::Dispatched));
        queue.apply(&status_patch("A", IncidentStatus::Ack));

        // Last arrival wins when no sequence numbers are attached
        assert_eq!(queue.incidents()[0].status, IncidentStatus::Ack);
    }

    fn unit(id: i64) -> Unit {
        Unit {
            id,
            name: format!("Patrol {id}"),
            unit_type: UnitType::Patrol,
            status: UnitStatus::Available,
            plate: None,
            lat: None,
            lng: None,
            last_seen: None,
        }
    }

    #[test]
    fn unit_board_merges_present_fields_only() {
        let mut board = UnitBoard::new();
        board.replace_snapshot(vec![unit(7)]);

        assert!(board.apply(&OpsEvent::UnitPatched(UnitPatched {
            id: 7,
            status: Some(UnitStatus::EnRoute),
            lat: Some(14.6),
            lng: None,
            last_seen: None,
            seq: None,
        })));

        let u = board.get(7).unwrap();
        assert_eq!(u.status, UnitStatus::EnRoute);
        assert_eq!(u.lat, Some(14.6));
        assert_eq!(u.lng, None);
        assert_eq!(u.name, "Patrol 7");
    }

    #[test]
    fn unit_board_ignores_unknown_unit() {
        let mut board = UnitBoard::new();
        board.replace_snapshot(vec![unit(7)]);

        assert!(!board.apply(&OpsEvent::UnitPatched(UnitPatched {
            id: 99,
            status: Some(UnitStatus::OnSite),
            lat: None,
            lng: None,
            last_seen: None,
            seq: None,
        })));
        assert_eq!(board.len(), 1);
    }

    #[test]
    fn unit_board_rejects_stale_seq() {
        let mut board = UnitBoard::new();
        board.replace_snapshot(vec![unit(7)]);

        let patch = |status, seq| {
            OpsEvent::UnitPatched(UnitPatched {
                id: 7,
                status: Some(status),
                lat: None,
                lng: None,
                last_seen: None,
                seq,
            })
        };

        assert!(board.apply(&patch(UnitStatus::OnSite, Some(10))));
        assert!(!board.apply(&patch(UnitStatus::Available, Some(9))));
        assert_eq!(board.get(7).unwrap().status, UnitStatus::OnSite);
    }

    #[test]
    fn watch_flags_dirty_only_for_its_incident() {
        let mut watch = IncidentWatch::new("A");

        assert!(!watch.apply(&status_patch("B", IncidentStatus::Closed)));
        assert!(!watch.take_dirty());

        assert!(watch.apply(&status_patch("A", IncidentStatus::Ack)));
        assert!(watch.take_dirty());
        assert!(!watch.take_dirty());
    }
}
