use {bigdecimal::BigDecimal, sqlx::PgConnection};

/// Adds `amount` to a user's balance, creating the row if needed. Also used
/// by the compensating refund after a terminal execution failure.
pub async fn credit(
    ex: &mut PgConnection,
    user_id: &str,
    amount: &BigDecimal,
) -> Result<(), sqlx::Error> {
    const QUERY: &str = r#"
INSERT INTO balances (user_id, amount)
VALUES ($1, $2)
ON CONFLICT (user_id) DO UPDATE SET amount = balances.amount + EXCLUDED.amount
    "#;
    sqlx::query(QUERY).bind(user_id).bind(amount).execute(ex).await?;
    Ok(())
}

/// Debits `amount` only if the balance covers it. Returns false on
/// insufficient balance (zero rows updated) leaving the balance untouched.
pub async fn try_debit(
    ex: &mut PgConnection,
    user_id: &str,
    amount: &BigDecimal,
) -> Result<bool, sqlx::Error> {
    const QUERY: &str = r#"
UPDATE balances
SET amount = amount - $2
WHERE user_id = $1 AND amount >= $2
    "#;
    let result = sqlx::query(QUERY).bind(user_id).bind(amount).execute(ex).await?;
    Ok(result.rows_affected() > 0)
}

pub async fn fetch(ex: &mut PgConnection, user_id: &str) -> Result<Option<BigDecimal>, sqlx::Error> {
    const QUERY: &str = "SELECT amount FROM balances WHERE user_id = $1";
    let row: Option<(BigDecimal,)> = sqlx::query_as(QUERY).bind(user_id).fetch_optional(ex).await?;
    Ok(row.map(|(amount,)| amount))
}
