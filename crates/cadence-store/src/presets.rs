/// System presets seeded once when the schema is created:
/// `(name, description, expression, category)`.
pub const SYSTEM_PRESETS: &[(&str, &str, &str, &str)] = &[
    ("Every minute", "Runs at the start of every minute", "* * * * *", "frequent"),
    ("Every 5 minutes", "Runs every five minutes", "*/5 * * * *", "frequent"),
    ("Every 15 minutes", "Runs every quarter hour", "*/15 * * * *", "frequent"),
    ("Every 30 minutes", "Runs on the hour and half hour", "*/30 * * * *", "frequent"),
    ("Hourly", "Runs at minute 0 of every hour", "@hourly", "hourly"),
    ("Every 6 hours", "Runs at 00:00, 06:00, 12:00 and 18:00", "0 */6 * * *", "hourly"),
    ("Daily at midnight", "Runs once a day at 00:00", "@daily", "daily"),
    ("Daily at 9 AM", "Runs once a day at 09:00", "0 9 * * *", "daily"),
    ("Weekdays at 9 AM", "Runs Monday to Friday at 09:00", "0 9 * * 1-5", "daily"),
    ("Weekly on Monday", "Runs every Monday at 09:00", "0 9 * * 1", "weekly"),
    ("Weekly", "Runs every Sunday at 00:00", "@weekly", "weekly"),
    ("Monthly", "Runs on the first day of each month at 00:00", "@monthly", "monthly"),
    ("Quarterly", "Runs on the first day of each quarter at 00:00", "0 0 1 1,4,7,10 *", "monthly"),
    ("Yearly", "Runs on January 1st at 00:00", "@yearly", "yearly"),
];
