use serde_json::json;
use tracing::info;
use ulid::Ulid;

use crate::collab::{CourtEventKind, MailTemplate};
use crate::model::*;

use super::tx::Tx;
use super::waitlist::Trigger;
use super::{Engine, EngineError, Receipt, Target, owns_or_privileged};

/// Move every pending item of the cart to `status` and report the slots freed.
fn release_items(tx: &mut Tx, cart: &Cart, status: ItemStatus) -> Result<Vec<Trigger>, EngineError> {
    let mut triggers = Vec::new();
    for p in &cart.items {
        let mut item = tx.line_item(&p.court_id, &p.id)?.clone();
        if item.status != ItemStatus::Pending {
            continue;
        }
        item.status = status;
        tx.broadcast(p.court_id, CourtEventKind::ItemReleased, p.id, Some(item.span));
        tx.save_line_item(item)?;
        triggers.push(Trigger::Freed { court_id: p.court_id, holder: p.id });
    }
    Ok(triggers)
}

impl Engine {
    /// Cancel whatever `id` names: a cart, a line-item, a reservation or a
    /// waitlist entry.
    pub async fn cancel(&self, actor: &Actor, id: Ulid) -> Result<Receipt<()>, EngineError> {
        match self.locate(id).await? {
            Target::Cart(cart_id) => self.cancel_cart(actor, cart_id).await,
            Target::LineItem { .. } => self.remove_line_item(actor, id).await,
            Target::Reservation { .. } => self.cancel_reservation(actor, id).await,
            Target::Waitlist { .. } => self.cancel_waitlist_entry(actor, id).await,
        }
    }

    /// Drop one pending line-item from its cart.
    pub async fn remove_line_item(&self, actor: &Actor, item_id: Ulid) -> Result<Receipt<()>, EngineError> {
        let (mut tx, located) = self.lock_target(item_id).await?;
        let Target::LineItem { court_id, cart_id } = located else {
            return Err(EngineError::invalid("target is not a line-item"));
        };
        let mut cart = tx.cart(&cart_id)?.clone();
        owns_or_privileged(actor, cart.owner.id)?;
        if cart.status != CartStatus::Pending {
            return Err(EngineError::state(format!("cart is {}", cart.status.as_str())));
        }
        let mut item = tx.line_item(&court_id, &item_id)?.clone();
        if item.status != ItemStatus::Pending {
            return Err(EngineError::state(format!("line-item is {}", item.status.as_str())));
        }

        item.status = ItemStatus::Cancelled;
        cart.aggregate_price -= item.price;
        tx.broadcast(court_id, CourtEventKind::ItemReleased, item_id, Some(item.span));
        tx.save_line_item(item)?;
        tx.save_cart(cart)?;
        self.settle(&mut tx, vec![Trigger::Freed { court_id, holder: item_id }])
            .await?;
        self.finish(tx, ()).await
    }

    /// Abandon a pending cart and everything in it.
    pub async fn cancel_cart(&self, actor: &Actor, cart_id: Ulid) -> Result<Receipt<()>, EngineError> {
        let mut tx = self.begin_for_cart(cart_id, &[]).await?;
        let mut cart = tx.cart(&cart_id)?.clone();
        owns_or_privileged(actor, cart.owner.id)?;
        if cart.status != CartStatus::Pending {
            return Err(EngineError::state(format!("cart is {}", cart.status.as_str())));
        }
        let triggers = release_items(&mut tx, &cart, ItemStatus::Cancelled)?;
        cart.status = CartStatus::Cancelled;
        tx.save_cart(cart)?;
        self.settle(&mut tx, triggers).await?;
        info!(%cart_id, "cart cancelled");
        self.finish(tx, ()).await
    }

    /// Pending carts of regular users idle past the TTL. Contended carts are
    /// skipped; the next sweep sees them again.
    pub fn stale_carts(&self) -> Vec<Ulid> {
        let cutoff = self.now() - self.policy.cart_ttl_ms;
        let carts: Vec<_> = self.carts.iter().map(|e| e.value().clone()).collect();
        let mut stale = Vec::new();
        for shared in carts {
            let Ok(cart) = shared.try_lock() else {
                continue;
            };
            if cart.status == CartStatus::Pending
                && !cart.owner.role.is_privileged()
                && cart.updated_at <= cutoff
            {
                stale.push(cart.id);
            }
        }
        stale
    }

    /// Expire an idle cart. Takes the same locks as checkout, so a cart
    /// being checked out is never expired underneath it. Returns false when
    /// the cart no longer qualifies; running it twice is harmless.
    pub async fn expire_cart(&self, cart_id: Ulid) -> Result<bool, EngineError> {
        let mut tx = self.begin_for_cart(cart_id, &[]).await?;
        let mut cart = tx.cart(&cart_id)?.clone();
        let idle = cart.status == CartStatus::Pending
            && !cart.owner.role.is_privileged()
            && cart.updated_at + self.policy.cart_ttl_ms <= tx.now;
        if !idle {
            return Ok(false);
        }

        let triggers = release_items(&mut tx, &cart, ItemStatus::Expired)?;
        cart.status = CartStatus::Expired;
        tx.mail(
            MailTemplate::CartExpired,
            cart.owner.id,
            json!({ "cart_id": cart_id.to_string(), "items": cart.items.len() }),
        );
        tx.save_cart(cart)?;
        self.settle(&mut tx, triggers).await?;
        self.finish(tx, ()).await?;
        info!(%cart_id, "idle cart expired");
        metrics::counter!(crate::observability::SWEEP_EXPIRED_TOTAL, "kind" => "cart").increment(1);
        Ok(true)
    }
}
