// =============================================================================
// SUBSCRIPTIONS
// =============================================================================
// Recurring parking passes. `start_date` is the billing anchor: after n
// renewals `end_date` is `start_date + (n + 1) periods`, whatever "now" is,
// so late renewals do not shift the cycle and month-end clamping does not
// accumulate.
// =============================================================================

use uuid::Uuid;

use super::{authorize_for, ReservationEngine};
use crate::error::{AppError, AppResult};
use crate::events::DomainEvent;
use crate::models::{Actor, CreateSubscriptionRequest, Subscription, SubscriptionResponse};
use crate::pricing::{add_period, add_periods, price_subscription};

impl ReservationEngine {
    pub async fn create_subscription(
        &self,
        actor: &Actor,
        request: CreateSubscriptionRequest,
    ) -> AppResult<Subscription> {
        let user_id = request.user_id.unwrap_or(actor.user_id);
        authorize_for(actor, user_id)?;

        let now = self.now();
        let start_date = request.start_date.unwrap_or(now);
        let subscription = Subscription {
            id: Uuid::new_v4(),
            user_id,
            tier: request.tier,
            period: request.period,
            start_date,
            end_date: add_period(start_date, request.period)?,
            auto_renew: request.auto_renew,
            amount: price_subscription(request.tier, request.period, &self.config.pricing),
            payment_id: request
                .payment_id
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty()),
            cancelled_at: None,
            renewal_count: 0,
            created_at: now,
        };
        let created = self.envelope(DomainEvent::SubscriptionCreated {
            subscription_id: subscription.id,
            user_id,
            amount: subscription.amount,
        });
        self.call("insert_subscription", || {
            self.store
                .insert_subscription(&subscription, std::slice::from_ref(&created))
        })
        .await?;

        tracing::info!(
            subscription_id = %subscription.id,
            user_id = %user_id,
            tier = subscription.tier.as_str(),
            period = subscription.period.as_str(),
            amount = subscription.amount,
            "Subscription created"
        );
        self.dispatch(created).await;
        Ok(subscription)
    }

    pub async fn get_subscription(
        &self,
        actor: &Actor,
        subscription_id: Uuid,
    ) -> AppResult<SubscriptionResponse> {
        let subscription = self.load_subscription(subscription_id).await?;
        authorize_for(actor, subscription.user_id)?;
        let status = subscription.status(self.now());
        Ok(SubscriptionResponse {
            subscription,
            status,
        })
    }

    /// Extend by one period on the billing anchor.
    pub async fn renew_subscription(
        &self,
        actor: &Actor,
        subscription_id: Uuid,
    ) -> AppResult<Subscription> {
        let _guard = self.subscription_locks.lock(subscription_id).await;
        let subscription = self.load_subscription(subscription_id).await?;
        authorize_for(actor, subscription.user_id)?;
        self.renew_once(subscription).await
    }

    /// Turn off auto-renew; the subscription runs until `end_date`.
    pub async fn cancel_auto_renew(
        &self,
        actor: &Actor,
        subscription_id: Uuid,
    ) -> AppResult<Subscription> {
        let _guard = self.subscription_locks.lock(subscription_id).await;
        let subscription = self.load_subscription(subscription_id).await?;
        authorize_for(actor, subscription.user_id)?;
        if subscription.cancelled_at.is_some() {
            return Err(AppError::SubscriptionNotActive(subscription_id));
        }
        if !subscription.auto_renew {
            return Ok(subscription);
        }

        let updated = Subscription {
            auto_renew: false,
            ..subscription
        };
        self.call("update_subscription", || self.store.update_subscription(&updated, &[]))
            .await?;
        tracing::info!(subscription_id = %subscription_id, end_date = %updated.end_date, "Auto-renew disabled");
        Ok(updated)
    }

    /// Cancel outright. Cancelling twice returns the cancelled record.
    pub async fn cancel_subscription(
        &self,
        actor: &Actor,
        subscription_id: Uuid,
    ) -> AppResult<Subscription> {
        let _guard = self.subscription_locks.lock(subscription_id).await;
        let subscription = self.load_subscription(subscription_id).await?;
        authorize_for(actor, subscription.user_id)?;
        if subscription.cancelled_at.is_some() {
            return Ok(subscription);
        }

        let cancelled = Subscription {
            auto_renew: false,
            cancelled_at: Some(self.now()),
            ..subscription
        };
        let event = self.envelope(DomainEvent::SubscriptionCancelled {
            subscription_id,
            user_id: cancelled.user_id,
        });
        self.call("update_subscription", || {
            self.store
                .update_subscription(&cancelled, std::slice::from_ref(&event))
        })
        .await?;

        tracing::info!(subscription_id = %subscription_id, user_id = %cancelled.user_id, "Subscription cancelled");
        self.dispatch(event).await;
        Ok(cancelled)
    }

    /// Renew every auto-renewing subscription whose `end_date` has passed,
    /// one period at a time until it lies in the future.
    ///
    /// Returns the number of periods renewed.
    pub async fn renew_due_subscriptions(&self) -> AppResult<usize> {
        let now = self.now();
        let due = self
            .call("subscriptions_due", || self.store.subscriptions_due(now))
            .await?;

        let mut renewed = 0;
        for candidate in due {
            let _guard = self.subscription_locks.lock(candidate.id).await;
            // re-read under the lock; a manual renewal may have run meanwhile
            let mut current = self.load_subscription(candidate.id).await?;
            while current.auto_renew && current.cancelled_at.is_none() && current.end_date <= now {
                current = self.renew_once(current).await?;
                renewed += 1;
            }
        }
        Ok(renewed)
    }

    async fn renew_once(&self, subscription: Subscription) -> AppResult<Subscription> {
        if subscription.cancelled_at.is_some() {
            return Err(AppError::SubscriptionNotActive(subscription.id));
        }
        let renewal_count = subscription.renewal_count + 1;
        let periods = u32::try_from(renewal_count + 1).map_err(|_| {
            AppError::EngineUnavailable(format!(
                "subscription {} has a corrupt renewal count",
                subscription.id
            ))
        })?;
        let renewed = Subscription {
            end_date: add_periods(subscription.start_date, subscription.period, periods)?,
            amount: price_subscription(subscription.tier, subscription.period, &self.config.pricing),
            renewal_count,
            ..subscription
        };
        let event = self.envelope(DomainEvent::SubscriptionRenewed {
            subscription_id: renewed.id,
            user_id: renewed.user_id,
            new_end_date: renewed.end_date,
            amount: renewed.amount,
        });
        self.call("update_subscription", || {
            self.store
                .update_subscription(&renewed, std::slice::from_ref(&event))
        })
        .await?;

        tracing::info!(
            subscription_id = %renewed.id,
            new_end_date = %renewed.end_date,
            renewal_count = renewed.renewal_count,
            "Subscription renewed"
        );
        self.dispatch(event).await;
        Ok(renewed)
    }
}
