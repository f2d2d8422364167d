use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::calendar;
use crate::limits::*;
use crate::model::*;

use super::oracle::{self, validate_span};
use super::{allocator, Engine, ParkError, WalCommand};

impl Engine {
    pub async fn create_site(
        &self,
        id: Ulid,
        name: String,
        lat: f64,
        lng: f64,
        category: SiteCategory,
    ) -> Result<(), ParkError> {
        if self.sites.len() >= MAX_SITES {
            return Err(ParkError::LimitExceeded("too many sites"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(ParkError::LimitExceeded("site name too long"));
        }
        if self.sites.contains_key(&id) {
            return Err(ParkError::AlreadyExists(id));
        }

        let event = Event::SiteCreated {
            id,
            name: name.clone(),
            lat,
            lng,
            category,
        };
        self.wal_append(&event).await?;
        self.sites.insert(
            id,
            Site {
                id,
                name,
                lat,
                lng,
                category,
            },
        );
        Ok(())
    }

    pub async fn create_building(
        &self,
        id: Ulid,
        site_id: Ulid,
        name: String,
    ) -> Result<(), ParkError> {
        if self.state.len() >= MAX_BUILDINGS {
            return Err(ParkError::LimitExceeded("too many buildings"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(ParkError::LimitExceeded("building name too long"));
        }
        if !self.sites.contains_key(&site_id) {
            return Err(ParkError::NotFound(site_id));
        }
        if self.state.contains_key(&id) {
            return Err(ParkError::AlreadyExists(id));
        }

        let event = Event::BuildingCreated {
            id,
            site_id,
            name: name.clone(),
        };
        self.wal_append(&event).await?;
        let bs = BuildingState::new(id, site_id, name);
        self.state.insert(id, Arc::new(RwLock::new(bs)));
        Ok(())
    }

    pub async fn add_schedule_rule(
        &self,
        building_id: Ulid,
        rule: ScheduleRule,
    ) -> Result<(), ParkError> {
        let shared = self
            .get_building(&building_id)
            .ok_or(ParkError::NotFound(building_id))?;
        let mut guard = shared.write().await;
        if guard.schedule.len() >= MAX_SCHEDULE_RULES {
            return Err(ParkError::LimitExceeded("too many schedule rules"));
        }
        calendar::validate_new_rule(&guard.schedule, &rule)?;

        let event = Event::ScheduleRuleAdded { building_id, rule };
        self.persist_and_apply(building_id, &mut guard, &event).await
    }

    pub async fn add_slot(
        &self,
        building_id: Ulid,
        key: SlotKey,
        vehicle: VehicleType,
    ) -> Result<(), ParkError> {
        if key.label().len() > MAX_LABEL_LEN {
            return Err(ParkError::LimitExceeded("slot label too long"));
        }
        let shared = self
            .get_building(&building_id)
            .ok_or(ParkError::NotFound(building_id))?;
        let mut guard = shared.write().await;
        if guard.slots.len() >= MAX_SLOTS_PER_BUILDING {
            return Err(ParkError::LimitExceeded("too many slots in building"));
        }
        if guard.slots.contains_key(&key) {
            return Err(ParkError::DuplicateSlot(key));
        }

        let event = Event::SlotAdded {
            building_id,
            key,
            vehicle,
        };
        self.persist_and_apply(building_id, &mut guard, &event).await
    }

    /// Create a pending reservation from a resolved draft.
    ///
    /// When the draft names a slot directly, that slot must exist, accept the
    /// vehicle, and be free; a conflict is returned as-is. Otherwise a
    /// candidate is picked optimistically under a read lock and re-checked
    /// under the write lock, with one re-pick if the candidate was taken in
    /// between. A zone with nothing free fails without retry.
    pub async fn reserve(
        &self,
        draft: BookingDraft,
        now: Ms,
    ) -> Result<ReservationInfo, ParkError> {
        let quote = draft.window.ok_or(ParkError::InvalidSpan)?;
        validate_span(&quote.span)?;
        if draft.user.len() > MAX_USER_LEN {
            return Err(ParkError::LimitExceeded("user name too long"));
        }
        let shared = self
            .get_building(&draft.building)
            .ok_or(ParkError::NotFound(draft.building))?;

        if let Some(key) = draft.slot.clone() {
            let guard = shared.clone().write_owned().await;
            let slot = guard
                .slots
                .get(&key)
                .ok_or_else(|| ParkError::SlotNotFound(key.clone()))?;
            if slot.vehicle != draft.vehicle {
                return Err(ParkError::VehicleMismatch(key));
            }
            oracle::check_slot_free(&guard, &key, &quote.span)?;
            return self.commit_reservation(guard, &draft, key, quote, now).await;
        }

        let picked = {
            let bs = shared.read().await;
            allocator::best_candidate(&bs, draft.zone.as_ref(), draft.vehicle, &quote.span)?
        };
        let guard = shared.clone().write_owned().await;
        let key = match oracle::check_slot_free(&guard, &picked, &quote.span) {
            Ok(()) => picked,
            Err(e) if e.is_conflict() => {
                // Lost the race for the picked slot between the read and
                // write sections. Re-pick once under the write lock; the
                // lock rules out a second conflict.
                allocator::best_candidate(&guard, draft.zone.as_ref(), draft.vehicle, &quote.span)?
            }
            Err(e) => return Err(e),
        };
        self.commit_reservation(guard, &draft, key, quote, now).await
    }

    async fn commit_reservation(
        &self,
        mut guard: tokio::sync::OwnedRwLockWriteGuard<BuildingState>,
        draft: &BookingDraft,
        key: SlotKey,
        quote: Quote,
        now: Ms,
    ) -> Result<ReservationInfo, ParkError> {
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_BUILDING {
            return Err(ParkError::LimitExceeded("too many reservations in building"));
        }
        let reservation = Reservation {
            id: Ulid::new(),
            user: draft.user.clone(),
            building: draft.building,
            slot: Some(key),
            vehicle: draft.vehicle,
            span: quote.span,
            status: ReservationStatus::Pending,
            booking: draft.booking,
            amount: quote.amount,
            created_at: now,
        };
        let event = Event::ReservationCreated {
            building_id: draft.building,
            reservation: reservation.clone(),
        };
        self.persist_and_apply(draft.building, &mut guard, &event)
            .await?;
        Ok(ReservationInfo::from_reservation(&reservation))
    }

    pub async fn set_status(
        &self,
        id: Ulid,
        next: ReservationStatus,
    ) -> Result<Ulid, ParkError> {
        let (building_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let current = guard
            .reservations
            .get(&id)
            .ok_or(ParkError::NotFound(id))?
            .status;
        if !current.can_transition_to(next) {
            return Err(ParkError::InvalidTransition {
                from: current,
                to: next,
            });
        }

        let event = Event::ReservationStatusChanged {
            building_id,
            id,
            status: next,
        };
        self.persist_and_apply(building_id, &mut guard, &event).await?;
        Ok(building_id)
    }

    pub async fn cancel(&self, id: Ulid) -> Result<Ulid, ParkError> {
        self.set_status(id, ReservationStatus::Cancelled).await
    }

    /// Pending reservations whose grace period has lapsed, as
    /// (reservation id, building id) pairs. Skips buildings with a
    /// write in flight; the next sweep catches them.
    pub fn collect_expired_pending(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let mut expired = Vec::new();
        for entry in self.state.iter() {
            let bs = entry.value().clone();
            if let Ok(guard) = bs.try_read() {
                for r in guard.reservations.values() {
                    if r.status == ReservationStatus::Pending
                        && r.created_at + PENDING_GRACE_MS <= now
                    {
                        expired.push((r.id, guard.id));
                    }
                }
            }
        }
        expired
    }

    /// Cancel every pending reservation whose grace period has lapsed.
    /// Returns the ids actually cancelled. A reservation confirmed between
    /// collection and cancellation is left alone, so the sweep is idempotent.
    pub async fn cancel_expired_pending(&self, now: Ms) -> Vec<Ulid> {
        let mut cancelled = Vec::new();
        for (id, _building_id) in self.collect_expired_pending(now) {
            match self.cancel(id).await {
                Ok(_) => cancelled.push(id),
                Err(ParkError::InvalidTransition { .. }) | Err(ParkError::NotFound(_)) => {}
                Err(e) => {
                    tracing::warn!("expired-pending cancel failed for {id}: {e}");
                }
            }
        }
        cancelled
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state. Terminal reservations are churn and are
    /// dropped; occupying ones are re-emitted with their current status.
    pub async fn compact_wal(&self) -> Result<(), ParkError> {
        let mut events = Vec::new();

        for entry in self.sites.iter() {
            let s = entry.value();
            events.push(Event::SiteCreated {
                id: s.id,
                name: s.name.clone(),
                lat: s.lat,
                lng: s.lng,
                category: s.category,
            });
        }

        let building_ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        for building_id in building_ids {
            let Some(shared) = self.get_building(&building_id) else {
                continue;
            };
            let guard = shared.read().await;

            events.push(Event::BuildingCreated {
                id: guard.id,
                site_id: guard.site_id,
                name: guard.name.clone(),
            });
            for rule in &guard.schedule {
                events.push(Event::ScheduleRuleAdded {
                    building_id,
                    rule: *rule,
                });
            }
            for (key, slot) in &guard.slots {
                events.push(Event::SlotAdded {
                    building_id,
                    key: key.clone(),
                    vehicle: slot.vehicle,
                });
            }
            for r in guard.reservations.values() {
                if r.status.is_occupying() {
                    events.push(Event::ReservationCreated {
                        building_id,
                        reservation: r.clone(),
                    });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| ParkError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| ParkError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| ParkError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
